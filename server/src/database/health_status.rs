use diesel::prelude::*;
use serde::Serialize;

use crate::controller::BaseError;
use crate::database::{Db, DbResult};
use crate::schema::enum_def::HealthState;
use crate::schema::sqlite::health_status;

/// Latest probe result per config, rewritten in place by each check.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = health_status)]
pub struct HealthStatus {
    pub config_id: i64,
    pub status: HealthState,
    pub checked_at: i64,
    pub response_time_ms: Option<i64>,
    pub model_count: Option<i32>,
    pub error_message: Option<String>,
}

impl HealthStatus {
    pub fn upsert(db: &Db, row: &HealthStatus) -> DbResult<()> {
        let conn = &mut db.conn()?;
        diesel::insert_into(health_status::table)
            .values(row)
            .on_conflict(health_status::config_id)
            .do_update()
            .set((
                health_status::status.eq(row.status),
                health_status::checked_at.eq(row.checked_at),
                health_status::response_time_ms.eq(row.response_time_ms),
                health_status::model_count.eq(row.model_count),
                health_status::error_message.eq(row.error_message.clone()),
            ))
            .execute(conn)
            .map(|_| ())
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to upsert health row: {e}"))))
    }

    pub fn get(db: &Db, config_id: i64) -> DbResult<Option<HealthStatus>> {
        let conn = &mut db.conn()?;
        health_status::table
            .find(config_id)
            .select(HealthStatus::as_select())
            .first(conn)
            .optional()
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }

    pub fn list_all(db: &Db) -> DbResult<Vec<HealthStatus>> {
        let conn = &mut db.conn()?;
        health_status::table
            .order(health_status::checked_at.desc())
            .select(HealthStatus::as_select())
            .load(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }
}
