use diesel::prelude::*;
use serde::Serialize;

use crate::controller::BaseError;
use crate::database::{Db, DbResult};
use crate::schema::enum_def::UsageStatus;
use crate::schema::sqlite::usage_record;

/// Append-only telemetry row, one per client request. Never updated.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = usage_record)]
pub struct UsageRecord {
    pub id: String,
    pub created_at: i64,
    pub client_ip: String,
    pub public_name: String,
    pub config_id: Option<i64>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub response_time_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = usage_record)]
pub struct NewUsageRecord {
    pub id: String,
    pub created_at: i64,
    pub client_ip: String,
    pub public_name: String,
    pub config_id: Option<i64>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub response_time_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
}

impl UsageRecord {
    /// One transaction per batch; the recorder sizes batches upstream.
    pub fn insert_batch(db: &Db, batch: &[NewUsageRecord]) -> DbResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let conn = &mut db.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(usage_record::table)
                .values(batch)
                .execute(conn)
        })
        .map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to insert usage batch: {e}"))))
    }

    pub fn list_recent(db: &Db, limit: i64) -> DbResult<Vec<UsageRecord>> {
        let conn = &mut db.conn()?;
        usage_record::table
            .order(usage_record::created_at.desc())
            .limit(limit)
            .select(UsageRecord::as_select())
            .load(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }

    pub fn count(db: &Db) -> DbResult<i64> {
        let conn = &mut db.conn()?;
        usage_record::table
            .count()
            .get_result(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }
}
