use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::controller::BaseError;
use crate::database::{now_millis, Db, DbResult};
use crate::schema::enum_def::ServiceType;
use crate::schema::sqlite::{health_status, llm_config};

/// One configured upstream. `api_key` always holds the encrypted blob here;
/// decryption and masking live in the service layer.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = llm_config)]
pub struct LlmConfig {
    pub id: i64,
    pub service_type: ServiceType,
    pub public_name: String,
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub is_enabled: bool,
    pub notes: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub available_on_general: bool,
    pub available_on_special: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = llm_config)]
pub struct NewLlmConfig {
    pub service_type: ServiceType,
    pub public_name: String,
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub is_enabled: bool,
    pub notes: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub available_on_general: bool,
    pub available_on_special: bool,
}

#[derive(Debug, Default, AsChangeset, Deserialize)]
#[diesel(table_name = llm_config)]
pub struct UpdateLlmConfig {
    pub service_type: Option<ServiceType>,
    pub public_name: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub is_enabled: Option<bool>,
    pub notes: Option<String>,
    pub available_on_general: Option<bool>,
    pub available_on_special: Option<bool>,
}

impl LlmConfig {
    pub fn create(db: &Db, data: &NewLlmConfig) -> DbResult<LlmConfig> {
        let conn = &mut db.conn()?;
        diesel::insert_into(llm_config::table)
            .values(data)
            .returning(LlmConfig::as_returning())
            .get_result(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to insert config: {e}"))))
    }

    pub fn update(db: &Db, id: i64, patch: &UpdateLlmConfig) -> DbResult<LlmConfig> {
        let conn = &mut db.conn()?;
        diesel::update(llm_config::table.find(id))
            .set((patch, llm_config::updated_at.eq(now_millis())))
            .returning(LlmConfig::as_returning())
            .get_result(conn)
            .optional()
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to update config {id}: {e}"))))?
            .ok_or_else(|| BaseError::NotFound(Some(format!("config {id} not found"))))
    }

    /// Hard delete. The health row goes with it (FK cascade), but the
    /// explicit delete keeps the behaviour even on pools where the pragma
    /// was never set.
    pub fn delete(db: &Db, id: i64) -> DbResult<()> {
        let conn = &mut db.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::delete(health_status::table.filter(health_status::config_id.eq(id)))
                .execute(conn)?;
            let deleted = diesel::delete(llm_config::table.find(id)).execute(conn)?;
            if deleted == 0 {
                return Err(diesel::result::Error::NotFound);
            }
            Ok(())
        })
        .map_err(|e| match e {
            diesel::result::Error::NotFound => {
                BaseError::NotFound(Some(format!("config {id} not found")))
            }
            other => BaseError::DatabaseFatal(Some(format!("failed to delete config {id}: {other}"))),
        })
    }

    pub fn get(db: &Db, id: i64) -> DbResult<Option<LlmConfig>> {
        let conn = &mut db.conn()?;
        llm_config::table
            .find(id)
            .select(LlmConfig::as_select())
            .first(conn)
            .optional()
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }

    pub fn list_all(db: &Db) -> DbResult<Vec<LlmConfig>> {
        let conn = &mut db.conn()?;
        llm_config::table
            .order(llm_config::created_at.asc())
            .select(LlmConfig::as_select())
            .load(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }

    pub fn list_enabled(db: &Db) -> DbResult<Vec<LlmConfig>> {
        let conn = &mut db.conn()?;
        llm_config::table
            .filter(llm_config::is_enabled.eq(true))
            .order(llm_config::created_at.asc())
            .select(LlmConfig::as_select())
            .load(conn)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }

    /// Another enabled row already claiming `public_name`? Used by the
    /// validation path before insert/update.
    pub fn enabled_name_taken(
        db: &Db,
        public_name: &str,
        exclude_id: Option<i64>,
    ) -> DbResult<bool> {
        let conn = &mut db.conn()?;
        let mut query = llm_config::table
            .filter(llm_config::is_enabled.eq(true))
            .filter(llm_config::public_name.eq(public_name))
            .into_boxed();
        if let Some(id) = exclude_id {
            query = query.filter(llm_config::id.ne(id));
        }
        query
            .count()
            .get_result::<i64>(conn)
            .map(|n| n > 0)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }
}
