//! Process configuration, loaded once at startup from the environment.
//!
//! An optional `.env` file is read first (via `dotenvy`, for local
//! development) and the process environment always takes precedence over
//! it. There is no global; [`Settings::from_env`] is called once in `main`
//! and the resulting struct is threaded through the worker, registry,
//! gateway, and context store.

use crate::error::{Error, Result};
use std::env;

/// Deployment environment. Affects log format and the dev-mode signature
/// bypass documented on the (out-of-scope) webhook receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
    Testing,
}

impl std::str::FromStr for AppEnv {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "production" => Ok(AppEnv::Production),
            "testing" => Ok(AppEnv::Testing),
            "development" | "" => Ok(AppEnv::Development),
            other => Err(Error::config(format!("unknown APP_ENV: {other}"))),
        }
    }
}

/// Full process configuration.
///
/// Required fields fail construction fast, the same way
/// `AgentOptionsBuilder::build` refuses to produce an `AgentOptions`
/// without `model`/`base_url`. Everything else has a default matching the
/// original service's settings module.
#[derive(Clone)]
pub struct Settings {
    pub app_env: AppEnv,

    pub redis_url: String,

    pub openai_api_key: String,
    pub openai_model: String,
    pub ai_confidence_threshold: f32,

    pub infobip_base_url: String,
    pub infobip_api_key: String,
    pub infobip_sender_number: String,
    pub infobip_secret_key: String,

    pub mobility_api_url: String,
    pub mobility_api_token: Option<String>,
    pub mobility_auth_url: Option<String>,
    pub mobility_client_id: Option<String>,
    pub mobility_client_secret: Option<String>,
    pub mobility_scope: Option<String>,

    pub swagger_url: Option<String>,
    pub sentry_dsn: Option<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("app_env", &self.app_env)
            .field("redis_url", &self.redis_url)
            .field("openai_api_key", &"***")
            .field("openai_model", &self.openai_model)
            .field("ai_confidence_threshold", &self.ai_confidence_threshold)
            .field("infobip_base_url", &self.infobip_base_url)
            .field("infobip_api_key", &"***")
            .field("infobip_sender_number", &self.infobip_sender_number)
            .field("infobip_secret_key", &"***")
            .field("mobility_api_url", &self.mobility_api_url)
            .field("mobility_api_token", &self.mobility_api_token.as_ref().map(|_| "***"))
            .field("mobility_auth_url", &self.mobility_auth_url)
            .field("mobility_client_id", &self.mobility_client_id)
            .field("mobility_client_secret", &self.mobility_client_secret.as_ref().map(|_| "***"))
            .field("mobility_scope", &self.mobility_scope)
            .field("swagger_url", &self.swagger_url)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "***"))
            .finish()
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::config(format!("missing required env var: {name}")))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Settings {
    /// Loads a `.env` file if present (ignored if absent), then reads the
    /// process environment. Required fields missing from both sources fail
    /// construction with a `Config` error.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let app_env = optional("APP_ENV")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(AppEnv::Development);

        Ok(Settings {
            app_env,
            redis_url: required("REDIS_URL")?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_model: optional("OPENAI_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            ai_confidence_threshold: optional("AI_CONFIDENCE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.85),
            infobip_base_url: required("INFOBIP_BASE_URL")?,
            infobip_api_key: required("INFOBIP_API_KEY")?,
            infobip_sender_number: required("INFOBIP_SENDER_NUMBER")?,
            infobip_secret_key: required("INFOBIP_SECRET_KEY")?,
            mobility_api_url: required("MOBILITY_API_URL")?,
            mobility_api_token: optional("MOBILITY_API_TOKEN"),
            mobility_auth_url: optional("MOBILITY_AUTH_URL"),
            mobility_client_id: optional("MOBILITY_CLIENT_ID"),
            mobility_client_secret: optional("MOBILITY_CLIENT_SECRET"),
            mobility_scope: optional("MOBILITY_SCOPE"),
            swagger_url: optional("SWAGGER_URL"),
            sentry_dsn: optional("SENTRY_DSN"),
        })
    }

    /// Whether the Tool Gateway has enough OAuth2 configuration to attempt
    /// a client-credentials refresh.
    pub fn oauth2_configured(&self) -> bool {
        self.mobility_auth_url.is_some()
            && self.mobility_client_id.is_some()
            && self.mobility_client_secret.is_some()
    }

    /// Minimal valid settings for unit/integration tests, bypassing
    /// `from_env`'s environment read. OAuth2 and swagger fields are left
    /// unset; callers override what their scenario needs. Exposed
    /// unconditionally (not `cfg(test)`-gated) so the integration suite
    /// under `tests/`, which compiles as a separate crate, can use it too.
    pub fn for_tests() -> Self {
        Settings {
            app_env: AppEnv::Testing,
            redis_url: "redis://localhost".into(),
            openai_api_key: "test-key".into(),
            openai_model: "gpt-3.5-turbo".into(),
            ai_confidence_threshold: 0.85,
            infobip_base_url: "https://infobip.example".into(),
            infobip_api_key: "test-infobip-key".into(),
            infobip_sender_number: "385000000".into(),
            infobip_secret_key: "test-hmac-secret".into(),
            mobility_api_url: "https://mobility.example".into(),
            mobility_api_token: Some("test-mobility-token".into()),
            mobility_auth_url: None,
            mobility_client_id: None,
            mobility_client_secret: None,
            mobility_scope: None,
            swagger_url: None,
            sentry_dsn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_env_parses_known_values() {
        assert_eq!("production".parse::<AppEnv>().unwrap(), AppEnv::Production);
        assert_eq!("Testing".parse::<AppEnv>().unwrap(), AppEnv::Testing);
        assert_eq!("".parse::<AppEnv>().unwrap(), AppEnv::Development);
    }

    #[test]
    fn app_env_rejects_unknown() {
        assert!("staging".parse::<AppEnv>().is_err());
    }

    #[test]
    fn debug_masks_secrets() {
        let settings = Settings {
            app_env: AppEnv::Development,
            redis_url: "redis://localhost".into(),
            openai_api_key: "sk-secret".into(),
            openai_model: "gpt-3.5-turbo".into(),
            ai_confidence_threshold: 0.85,
            infobip_base_url: "api.infobip.com".into(),
            infobip_api_key: "infobip-secret".into(),
            infobip_sender_number: "123".into(),
            infobip_secret_key: "hmac-secret".into(),
            mobility_api_url: "https://mobility.example".into(),
            mobility_api_token: Some("token-secret".into()),
            mobility_auth_url: None,
            mobility_client_id: None,
            mobility_client_secret: None,
            mobility_scope: None,
            swagger_url: None,
            sentry_dsn: None,
        };

        let debug = format!("{settings:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("infobip-secret"));
        assert!(!debug.contains("hmac-secret"));
        assert!(!debug.contains("token-secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn oauth2_configured_requires_all_three() {
        let base = Settings {
            app_env: AppEnv::Testing,
            redis_url: "redis://localhost".into(),
            openai_api_key: "k".into(),
            openai_model: "m".into(),
            ai_confidence_threshold: 0.85,
            infobip_base_url: "x".into(),
            infobip_api_key: "x".into(),
            infobip_sender_number: "x".into(),
            infobip_secret_key: "x".into(),
            mobility_api_url: "x".into(),
            mobility_api_token: None,
            mobility_auth_url: None,
            mobility_client_id: None,
            mobility_client_secret: None,
            mobility_scope: None,
            swagger_url: None,
            sentry_dsn: None,
        };
        assert!(!base.oauth2_configured());

        let mut configured = base.clone();
        configured.mobility_auth_url = Some("https://auth.example".into());
        configured.mobility_client_id = Some("id".into());
        configured.mobility_client_secret = Some("secret".into());
        assert!(configured.oauth2_configured());
    }
}
