use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::BaseError;
use crate::database::llm_config::{LlmConfig, NewLlmConfig, UpdateLlmConfig};
use crate::database::{now_millis, Db, DbResult};
use crate::schema::enum_def::ServiceType;
use crate::service::secrets::{mask_api_key, SecretCipher};
use crate::service::snapshot::{ConfigSnapshot, RouteTarget, SnapshotHandle};

/// Admin-facing creation payload. `api_key` arrives in plaintext and never
/// leaves this layer unencrypted.
#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub service_type: ServiceType,
    pub public_name: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_true")]
    pub available_on_general: bool,
    #[serde(default = "default_true")]
    pub available_on_special: bool,
    #[serde(default)]
    pub notes: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateConfigRequest {
    pub service_type: Option<ServiceType>,
    pub public_name: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub is_enabled: Option<bool>,
    pub available_on_general: Option<bool>,
    pub available_on_special: Option<bool>,
    pub notes: Option<String>,
}

/// What the admin API returns: the stored row with the key replaced by its
/// display mask (or plaintext when `reveal` was requested).
#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub id: i64,
    pub service_type: ServiceType,
    pub public_name: String,
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub is_enabled: bool,
    pub available_on_general: bool,
    pub available_on_special: bool,
    pub notes: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
pub struct ReloadFailure {
    pub id: i64,
    pub public_name: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadReport {
    pub loaded: usize,
    pub failed: Vec<ReloadFailure>,
}

#[derive(Clone)]
pub struct ConfigService {
    db: Db,
    cipher: SecretCipher,
    snapshot: Arc<SnapshotHandle>,
}

impl ConfigService {
    pub fn new(db: Db, cipher: SecretCipher, snapshot: Arc<SnapshotHandle>) -> Self {
        ConfigService {
            db,
            cipher,
            snapshot,
        }
    }

    pub fn create(&self, req: CreateConfigRequest) -> DbResult<ConfigView> {
        validate(
            &self.db,
            None,
            req.service_type,
            &req.public_name,
            &req.base_url,
            req.is_enabled,
            req.available_on_general,
            req.available_on_special,
        )?;

        let now = now_millis();
        let row = LlmConfig::create(
            &self.db,
            &NewLlmConfig {
                service_type: req.service_type,
                public_name: req.public_name.trim().to_string(),
                model_name: req.model_name,
                api_key: self
                    .cipher
                    .encrypt(&req.api_key)
                    .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))?,
                base_url: req.base_url,
                is_enabled: req.is_enabled,
                notes: req.notes,
                created_at: now,
                updated_at: now,
                available_on_general: req.available_on_general,
                available_on_special: req.available_on_special,
            },
        )?;

        self.reload()?;
        Ok(self.view(row, false))
    }

    pub fn update(&self, id: i64, req: UpdateConfigRequest) -> DbResult<ConfigView> {
        let current =
            LlmConfig::get(&self.db, id)?.ok_or_else(|| BaseError::NotFound(Some(format!("config {id} not found"))))?;

        let service_type = req.service_type.unwrap_or(current.service_type);
        let public_name = req
            .public_name
            .clone()
            .unwrap_or_else(|| current.public_name.clone());
        let base_url = req.base_url.clone().unwrap_or_else(|| current.base_url.clone());
        let is_enabled = req.is_enabled.unwrap_or(current.is_enabled);
        let on_general = req.available_on_general.unwrap_or(current.available_on_general);
        let on_special = req.available_on_special.unwrap_or(current.available_on_special);

        validate(
            &self.db,
            Some(id),
            service_type,
            &public_name,
            &base_url,
            is_enabled,
            on_general,
            on_special,
        )?;

        // A key that round-tripped through list() comes back masked; treat
        // that as "unchanged" rather than storing stars.
        let api_key = match req.api_key {
            None => None,
            Some(submitted) => {
                let stored_plain = self.cipher.decrypt(&current.api_key).unwrap_or_default();
                if submitted == stored_plain || submitted == mask_api_key(&stored_plain) {
                    None
                } else {
                    Some(
                        self.cipher
                            .encrypt(&submitted)
                            .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))?,
                    )
                }
            }
        };

        let row = LlmConfig::update(
            &self.db,
            id,
            &UpdateLlmConfig {
                service_type: req.service_type,
                public_name: req.public_name.map(|n| n.trim().to_string()),
                model_name: req.model_name,
                api_key,
                base_url: req.base_url,
                is_enabled: req.is_enabled,
                notes: req.notes,
                available_on_general: req.available_on_general,
                available_on_special: req.available_on_special,
            },
        )?;

        self.reload()?;
        Ok(self.view(row, false))
    }

    pub fn delete(&self, id: i64) -> DbResult<()> {
        LlmConfig::delete(&self.db, id)?;
        self.reload()?;
        Ok(())
    }

    pub fn get(&self, id: i64, reveal: bool) -> DbResult<Option<ConfigView>> {
        Ok(LlmConfig::get(&self.db, id)?.map(|row| self.view(row, reveal)))
    }

    pub fn list(&self) -> DbResult<Vec<ConfigView>> {
        Ok(LlmConfig::list_all(&self.db)?
            .into_iter()
            .map(|row| self.view(row, false))
            .collect())
    }

    /// Rebuilds the routing snapshot from the enabled rows and publishes it
    /// in one atomic store. Rows that fail validation are excluded and
    /// reported; the rest still go live.
    pub fn reload(&self) -> DbResult<ReloadReport> {
        let rows = LlmConfig::list_enabled(&self.db)?;
        let mut targets = Vec::with_capacity(rows.len());
        let mut failed = Vec::new();

        for row in rows {
            match self.build_target(&row) {
                Ok(target) => targets.push(target),
                Err(reason) => {
                    warn!(id = row.id, public_name = %row.public_name, %reason, "config excluded from reload");
                    failed.push(ReloadFailure {
                        id: row.id,
                        public_name: row.public_name,
                        reason,
                    });
                }
            }
        }

        let loaded = targets.len();
        self.snapshot
            .publish(ConfigSnapshot::new(targets, now_millis()));
        info!(loaded, failed = failed.len(), "published config snapshot");
        Ok(ReloadReport { loaded, failed })
    }

    /// Same resolution the reload path uses, for probing a stored row (even
    /// a disabled one) without publishing anything.
    pub fn build_probe_target(&self, row: &LlmConfig) -> Result<RouteTarget, String> {
        self.build_target(row)
    }

    fn build_target(&self, row: &LlmConfig) -> Result<RouteTarget, String> {
        if row.service_type == ServiceType::None {
            return Err("service_type 'none' is not routable".to_string());
        }

        let api_key = self
            .cipher
            .decrypt(&row.api_key)
            .map_err(|e| format!("api_key cannot be decrypted: {e}"))?;

        let base_url = if row.base_url.trim().is_empty() {
            row.service_type
                .default_base_url()
                .ok_or_else(|| format!("service_type '{}' requires an explicit base_url", row.service_type))?
                .to_string()
        } else {
            row.base_url.trim().trim_end_matches('/').to_string()
        };

        Ok(RouteTarget {
            config_id: row.id,
            service_type: row.service_type,
            public_name: row.public_name.clone(),
            model_name: row.model_name.clone(),
            api_key,
            base_url,
            available_on_general: row.available_on_general,
            available_on_special: row.available_on_special,
            created_at: row.created_at,
        })
    }

    fn view(&self, row: LlmConfig, reveal: bool) -> ConfigView {
        let plaintext = self.cipher.decrypt(&row.api_key).unwrap_or_default();
        ConfigView {
            id: row.id,
            service_type: row.service_type,
            public_name: row.public_name,
            model_name: row.model_name,
            api_key: if reveal {
                plaintext
            } else {
                mask_api_key(&plaintext)
            },
            base_url: row.base_url,
            is_enabled: row.is_enabled,
            available_on_general: row.available_on_general,
            available_on_special: row.available_on_special,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::health_status::HealthStatus;
    use crate::database::llm_config::LlmConfig;
    use crate::schema::enum_def::HealthState;

    fn service() -> (tempfile::TempDir, ConfigService) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::establish(&tmp.path().join("bridge.db")).unwrap();
        let cipher = SecretCipher::load_or_create(&tmp.path().join(".encryption_key")).unwrap();
        let service = ConfigService::new(db, cipher, Arc::new(SnapshotHandle::empty()));
        (tmp, service)
    }

    fn request(public_name: &str) -> CreateConfigRequest {
        CreateConfigRequest {
            service_type: ServiceType::Openai,
            public_name: public_name.to_string(),
            model_name: "gpt-4-0613".to_string(),
            api_key: "sk-plaintext-123456".to_string(),
            base_url: String::new(),
            is_enabled: true,
            available_on_general: true,
            available_on_special: true,
            notes: String::new(),
        }
    }

    #[test]
    fn api_key_is_encrypted_at_rest_and_masked_on_list() {
        let (_tmp, service) = service();
        let created = service.create(request("gpt-4")).unwrap();

        let stored = LlmConfig::get(&service.db, created.id).unwrap().unwrap();
        assert_ne!(stored.api_key, "sk-plaintext-123456");
        assert!(!stored.api_key.contains("plaintext"));

        let listed = &service.list().unwrap()[0];
        assert_eq!(listed.api_key, mask_api_key("sk-plaintext-123456"));
        assert!(listed.api_key.contains('*'));

        let revealed = service.get(created.id, true).unwrap().unwrap();
        assert_eq!(revealed.api_key, "sk-plaintext-123456");
    }

    #[test]
    fn masked_key_round_trip_does_not_clobber_the_secret() {
        let (_tmp, service) = service();
        let created = service.create(request("gpt-4")).unwrap();
        let masked = service.list().unwrap()[0].api_key.clone();

        service
            .update(
                created.id,
                UpdateConfigRequest {
                    api_key: Some(masked),
                    notes: Some("edited".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let revealed = service.get(created.id, true).unwrap().unwrap();
        assert_eq!(revealed.api_key, "sk-plaintext-123456");

        service
            .update(
                created.id,
                UpdateConfigRequest {
                    api_key: Some("sk-rotated".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let revealed = service.get(created.id, true).unwrap().unwrap();
        assert_eq!(revealed.api_key, "sk-rotated");
    }

    #[test]
    fn duplicate_enabled_public_name_is_rejected() {
        let (_tmp, service) = service();
        service.create(request("gpt-4")).unwrap();
        assert!(service.create(request("gpt-4")).is_err());

        // A disabled row may reuse the name.
        let mut disabled = request("gpt-4");
        disabled.is_enabled = false;
        assert!(service.create(disabled).is_ok());
    }

    #[test]
    fn enabled_config_needs_an_endpoint() {
        let (_tmp, service) = service();
        let mut req = request("nowhere");
        req.available_on_general = false;
        req.available_on_special = false;
        assert!(service.create(req).is_err());
    }

    #[test]
    fn openai_compatible_requires_base_url_and_none_cannot_be_enabled() {
        let (_tmp, service) = service();

        let mut compatible = request("compat");
        compatible.service_type = ServiceType::OpenaiCompatible;
        assert!(service.create(compatible).is_err());

        let mut none = request("void");
        none.service_type = ServiceType::None;
        assert!(service.create(none).is_err());
    }

    #[test]
    fn reload_publishes_enabled_rows_with_defaulted_urls() {
        let (_tmp, service) = service();
        service.create(request("gpt-4")).unwrap();
        let mut disabled = request("hidden");
        disabled.is_enabled = false;
        service.create(disabled).unwrap();

        let report = service.reload().unwrap();
        assert_eq!(report.loaded, 1);
        assert!(report.failed.is_empty());

        let snapshot = service.snapshot.load();
        let target = snapshot.resolve("gpt-4").unwrap();
        assert_eq!(target.base_url, "https://api.openai.com/v1");
        assert_eq!(target.api_key, "sk-plaintext-123456");
        assert!(snapshot.resolve("hidden").is_none());
    }

    #[test]
    fn delete_cascades_to_health_rows() {
        let (_tmp, service) = service();
        let created = service.create(request("gpt-4")).unwrap();
        HealthStatus::upsert(
            &service.db,
            &HealthStatus {
                config_id: created.id,
                status: HealthState::Ok,
                checked_at: 1,
                response_time_ms: Some(5),
                model_count: Some(3),
                error_message: None,
            },
        )
        .unwrap();

        service.delete(created.id).unwrap();
        assert!(HealthStatus::get(&service.db, created.id).unwrap().is_none());
        assert!(service.get(created.id, false).unwrap().is_none());
    }
}

#[allow(clippy::too_many_arguments)]
fn validate(
    db: &Db,
    exclude_id: Option<i64>,
    service_type: ServiceType,
    public_name: &str,
    base_url: &str,
    is_enabled: bool,
    on_general: bool,
    on_special: bool,
) -> DbResult<()> {
    if public_name.trim().is_empty() {
        return Err(BaseError::ParamInvalid(Some(
            "public_name must not be empty".to_string(),
        )));
    }
    if is_enabled {
        if !(on_general || on_special) {
            return Err(BaseError::ParamInvalid(Some(
                "an enabled config must be available on at least one endpoint".to_string(),
            )));
        }
        if service_type == ServiceType::None {
            return Err(BaseError::ParamInvalid(Some(
                "service_type 'none' cannot be enabled".to_string(),
            )));
        }
        if service_type == ServiceType::OpenaiCompatible && base_url.trim().is_empty() {
            return Err(BaseError::ParamInvalid(Some(
                "openai_compatible requires a base_url".to_string(),
            )));
        }
        if LlmConfig::enabled_name_taken(db, public_name.trim(), exclude_id)? {
            return Err(BaseError::DatabaseDup(Some(format!(
                "public_name '{}' is already used by an enabled config",
                public_name.trim()
            ))));
        }
    }
    Ok(())
}
