use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Fully resolved process configuration. Everything comes from the
/// environment; unset variables fall back to the documented defaults.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub encryption_key_path: PathBuf,
    pub initial_password: Option<String>,
    pub web_ui_port: u16,
    pub proxy_port_general: u16,
    pub proxy_port_special: u16,
    pub upstream_timeout_secs: u64,
    pub upstream_ttfb_timeout_secs: u64,
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl RuntimeConfig {
    fn from_env() -> Self {
        let data_dir: PathBuf = get_env_var("DATA_DIR").unwrap_or_else(|| PathBuf::from("data"));

        let database_path: PathBuf = get_env_var("DATABASE_PATH")
            .unwrap_or_else(|| data_dir.join("clads_llm_bridge.db"));

        let encryption_key_path: PathBuf = get_env_var("ENCRYPTION_KEY_PATH").unwrap_or_else(|| {
            database_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(".encryption_key")
        });

        // Legacy PROXY_PORT aliases the general listener.
        let proxy_port_general = get_env_var("PROXY_PORT_GENERAL")
            .or_else(|| get_env_var("PROXY_PORT"))
            .unwrap_or(4321);

        RuntimeConfig {
            log_level: get_env_var("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
            data_dir,
            database_path,
            encryption_key_path,
            initial_password: get_env_var("INITIAL_PASSWORD"),
            web_ui_port: get_env_var("WEB_UI_PORT").unwrap_or(4322),
            proxy_port_general,
            proxy_port_special: get_env_var("PROXY_PORT_SPECIAL").unwrap_or(4333),
            upstream_timeout_secs: get_env_var("UPSTREAM_TIMEOUT_SECS").unwrap_or(120),
            upstream_ttfb_timeout_secs: get_env_var("UPSTREAM_TTFB_TIMEOUT_SECS").unwrap_or(30),
        }
    }
}

pub static CONFIG: Lazy<RuntimeConfig> = Lazy::new(RuntimeConfig::from_env);
