use std::fs::File;
use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::{Connection, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;
use tracing::info;

use crate::controller::BaseError;

pub mod auth;
pub mod health_status;
pub mod llm_config;
pub mod stat;
pub mod usage_record;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;
pub type DbResult<T> = Result<T, BaseError>;

#[derive(Debug, Error)]
pub enum DbInitError {
    #[error("failed to create database file {0}: {1}")]
    CreateFile(String, String),
    #[error("failed to open database {0}: {1}")]
    Open(String, String),
    #[error("failed to run migrations: {0}")]
    Migration(String),
    #[error("failed to build connection pool: {0}")]
    Pool(String),
}

/// Shared sqlite handle. Cheap to clone; every clone points at the same pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

/// Applied to every pooled connection: cascades need foreign_keys, and a
/// busy_timeout keeps concurrent writers from surfacing SQLITE_BUSY.
#[derive(Debug)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

impl Db {
    /// Opens (creating if necessary) the database file, applies pending
    /// migrations in order, and builds the pool. Each registered migration
    /// runs in its own transaction, so a failing step rolls back and leaves
    /// the previous schema version in place.
    pub fn establish(db_path: &Path) -> Result<Self, DbInitError> {
        if !db_path.exists() {
            if let Some(parent) = db_path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DbInitError::CreateFile(db_path.display().to_string(), e.to_string())
                    })?;
                }
            }
            File::create(db_path).map_err(|e| {
                DbInitError::CreateFile(db_path.display().to_string(), e.to_string())
            })?;
        }

        let db_url = db_path.display().to_string();
        let mut connection = SqliteConnection::establish(&db_url)
            .map_err(|e| DbInitError::Open(db_url.clone(), e.to_string()))?;

        let applied = connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| DbInitError::Migration(e.to_string()))?;
        if !applied.is_empty() {
            info!(count = applied.len(), "applied schema migrations");
        }

        let manager = ConnectionManager::<SqliteConnection>::new(&db_url);
        let pool = Pool::builder()
            .test_on_check_out(true)
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| DbInitError::Pool(e.to_string()))?;

        Ok(Db { pool })
    }

    pub fn conn(&self) -> DbResult<DbConnection> {
        self.pool
            .get()
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("connection pool exhausted: {e}"))))
    }

    /// Shallow reachability probe for the health endpoints.
    pub fn ping(&self) -> bool {
        self.pool
            .get()
            .map(|mut c| c.batch_execute("SELECT 1").is_ok())
            .unwrap_or(false)
    }

    /// True when every registered migration has been applied.
    pub fn migrations_current(&self) -> DbResult<bool> {
        let mut conn = self.conn()?;
        conn.has_pending_migration(MIGRATIONS)
            .map(|pending| !pending)
            .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
