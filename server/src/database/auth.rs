use diesel::prelude::*;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::controller::BaseError;
use crate::database::{now_millis, Db, DbResult};
use crate::schema::sqlite::auth_config;

/// Singleton credentials row consumed by the (out-of-scope) admin UI. The
/// core only seeds and hosts it.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = auth_config)]
pub struct AuthConfig {
    pub id: i32,
    pub password_hash: String,
    pub salt: String,
    pub session_secret: String,
    pub created_at: i64,
    pub updated_at: i64,
}

fn random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl AuthConfig {
    /// Seeds the row on first start. `INITIAL_PASSWORD` wins when set;
    /// otherwise a random password is generated and logged once so the
    /// operator can change it from the UI.
    pub fn seed_if_missing(db: &Db, initial_password: Option<&str>) -> DbResult<()> {
        let conn = &mut db.conn()?;
        let existing: Option<i32> = auth_config::table
            .select(auth_config::id)
            .first(conn)
            .optional()
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
        if existing.is_some() {
            return Ok(());
        }

        let generated;
        let password = match initial_password {
            Some(p) if !p.is_empty() => p,
            _ => {
                generated = random_string(16);
                info!(password = %generated, "no INITIAL_PASSWORD set, generated admin password");
                &generated
            }
        };

        let salt = random_string(32);
        let now = now_millis();
        let row = AuthConfig {
            id: 1,
            password_hash: hash_password(password, &salt),
            salt,
            session_secret: random_string(48),
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(auth_config::table)
            .values(&row)
            .execute(conn)
            .map(|_| ())
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to seed auth row: {e}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::establish(&dir.path().join("auth.db")).unwrap();

        AuthConfig::seed_if_missing(&db, Some("first")).unwrap();
        AuthConfig::seed_if_missing(&db, Some("second")).unwrap();

        let conn = &mut db.conn().unwrap();
        let row: AuthConfig = auth_config::table
            .select(AuthConfig::as_select())
            .first(conn)
            .unwrap();
        assert_eq!(row.password_hash, hash_password("first", &row.salt));
        assert_ne!(row.password_hash, hash_password("second", &row.salt));
    }
}
