use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Closed set of upstream provider kinds. Stored as lowercase text so the
/// rows stay readable with plain sqlite tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Default, strum_macros::Display)]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceType {
    Openai,
    Anthropic,
    Gemini,
    Openrouter,
    VscodeProxy,
    Lmstudio,
    OpenaiCompatible,
    #[default]
    None,
}

impl ServiceType {
    /// Default upstream base URL when a config leaves `base_url` empty.
    /// `openai_compatible` has no default on purpose: a custom URL is the
    /// whole point of that type.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ServiceType::Openai => Some("https://api.openai.com/v1"),
            ServiceType::Anthropic => Some("https://api.anthropic.com"),
            ServiceType::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            ServiceType::Openrouter => Some("https://openrouter.ai/api/v1"),
            ServiceType::VscodeProxy => Some("http://127.0.0.1:3000"),
            ServiceType::Lmstudio => Some("http://127.0.0.1:1234/v1"),
            ServiceType::OpenaiCompatible | ServiceType::None => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(
            self,
            ServiceType::Openai
                | ServiceType::Anthropic
                | ServiceType::Gemini
                | ServiceType::Openrouter
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default, strum_macros::Display)]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsageStatus {
    #[default]
    Success,
    ClientError,
    UpstreamError,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default, strum_macros::Display)]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Ok,
    Ng,
    #[default]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_tags_are_lowercase() {
        assert_eq!(ServiceType::VscodeProxy.to_string(), "vscode_proxy");
        assert_eq!(ServiceType::OpenaiCompatible.to_string(), "openai_compatible");
        assert_eq!(
            serde_json::to_value(ServiceType::Openai).unwrap(),
            serde_json::json!("openai")
        );
    }

    #[test]
    fn default_base_urls() {
        assert_eq!(
            ServiceType::Openai.default_base_url(),
            Some("https://api.openai.com/v1")
        );
        assert_eq!(ServiceType::OpenaiCompatible.default_base_url(), None);
        assert_eq!(ServiceType::None.default_base_url(), None);
    }
}
