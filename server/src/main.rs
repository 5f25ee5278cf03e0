use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::CONFIG;
use crate::database::auth::AuthConfig;
use crate::database::{Db, DbInitError};
use crate::service::config_service::ConfigService;
use crate::service::secrets::SecretCipher;
use crate::service::snapshot::{EndpointKind, SnapshotHandle};
use crate::service::usage::UsageRecorder;
use crate::service::AppState;

mod adapters;
mod config;
mod controller;
mod database;
mod proxy;
mod schema;
mod service;
mod utils;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_MIGRATION_FAILURE: u8 = 2;
const EXIT_BIND_FAILURE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_new(CONFIG.log_level.to_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = match Db::establish(&CONFIG.database_path) {
        Ok(db) => db,
        Err(e @ DbInitError::Migration(_)) => {
            error!(error = %e, "schema migration failed, refusing to start");
            return ExitCode::from(EXIT_MIGRATION_FAILURE);
        }
        Err(e) => {
            error!(error = %e, "database setup failed");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!(path = %CONFIG.database_path.display(), "database ready");

    let cipher = match SecretCipher::load_or_create(&CONFIG.encryption_key_path) {
        Ok(cipher) => cipher,
        Err(e) => {
            error!(error = %e, "encryption key unavailable");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = AuthConfig::seed_if_missing(&db, CONFIG.initial_password.as_deref()) {
        error!(error = %e, "failed to seed admin credentials");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let snapshot = Arc::new(SnapshotHandle::empty());
    let configs = ConfigService::new(db.clone(), cipher, snapshot.clone());
    match configs.reload() {
        Ok(report) => info!(
            loaded = report.loaded,
            failed = report.failed.len(),
            "initial config snapshot published"
        ),
        Err(e) => {
            error!(error = %e, "failed to load configs");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    let recorder = UsageRecorder::spawn(db.clone());
    let state = AppState::new(db, configs, snapshot, recorder);

    let general = match bind(CONFIG.proxy_port_general).await {
        Ok(l) => l,
        Err(code) => return code,
    };
    let special = match bind(CONFIG.proxy_port_special).await {
        Ok(l) => l,
        Err(code) => return code,
    };
    let admin = match bind(CONFIG.web_ui_port).await {
        Ok(l) => l,
        Err(code) => return code,
    };

    info!(
        general = CONFIG.proxy_port_general,
        special = CONFIG.proxy_port_special,
        admin = CONFIG.web_ui_port,
        "listeners bound"
    );

    let general_app = proxy::create_proxy_router(EndpointKind::General)
        .with_state(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let special_app = proxy::create_proxy_router(EndpointKind::Special)
        .with_state(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let admin_app = controller::create_admin_router()
        .with_state(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let served = tokio::try_join!(
        axum::serve(general, general_app).into_future(),
        axum::serve(special, special_app).into_future(),
        axum::serve(admin, admin_app).into_future(),
    );

    match served {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server terminated unexpectedly");
            ExitCode::from(10)
        }
    }
}

async fn bind(port: u16) -> Result<TcpListener, ExitCode> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            error!(port, error = %e, "failed to bind listener");
            Err(ExitCode::from(EXIT_BIND_FAILURE))
        }
    }
}
