pub mod config_service;
pub mod secrets;
pub mod snapshot;
pub mod usage;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CONFIG;
use crate::database::Db;
use crate::service::config_service::ConfigService;
use crate::service::snapshot::SnapshotHandle;
use crate::service::usage::UsageRecorder;

/// Everything the listeners share. Cheap to clone behind `Arc`.
pub struct AppState {
    pub db: Db,
    pub configs: ConfigService,
    pub snapshot: Arc<SnapshotHandle>,
    pub recorder: UsageRecorder,
    pub http: reqwest::Client,
    pub in_flight: AtomicU64,
    pub upstream_timeout: Duration,
    pub ttfb_timeout: Duration,
}

impl AppState {
    pub fn new(db: Db, configs: ConfigService, snapshot: Arc<SnapshotHandle>, recorder: UsageRecorder) -> Arc<Self> {
        Arc::new(AppState {
            db,
            configs,
            snapshot,
            recorder,
            http: reqwest::Client::new(),
            in_flight: AtomicU64::new(0),
            upstream_timeout: Duration::from_secs(CONFIG.upstream_timeout_secs),
            ttfb_timeout: Duration::from_secs(CONFIG.upstream_ttfb_timeout_secs),
        })
    }

    #[cfg(test)]
    pub fn with_timeouts(
        db: Db,
        configs: ConfigService,
        snapshot: Arc<SnapshotHandle>,
        recorder: UsageRecorder,
        upstream_timeout: Duration,
        ttfb_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(AppState {
            db,
            configs,
            snapshot,
            recorder,
            http: reqwest::Client::new(),
            in_flight: AtomicU64::new(0),
            upstream_timeout,
            ttfb_timeout,
        })
    }
}
