//! `ToolGateway`: dynamic HTTP dispatch over OpenAPI operation metadata
//! plus a parameter bag (SPEC_FULL.md §4.6). Binds path/header/body params,
//! refreshes an OAuth2 client-credentials token on 401, and trips a circuit
//! breaker after repeated upstream failures.

use crate::error::{Error, Result};
use crate::types::{HttpMethod, ToolDefinition, ToolResult};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_OPEN_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

impl OAuth2Config {
    /// Builds a config from `Settings` iff all required OAuth2 fields are
    /// present (`Settings::oauth2_configured`).
    pub fn from_settings(settings: &crate::config::Settings) -> Option<Self> {
        if !settings.oauth2_configured() {
            return None;
        }
        Some(Self {
            auth_url: settings.mobility_auth_url.clone().unwrap_or_default(),
            client_id: settings.mobility_client_id.clone().unwrap_or_default(),
            client_secret: settings.mobility_client_secret.clone().unwrap_or_default(),
            scope: settings.mobility_scope.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
}

struct CircuitBreaker {
    failures: AtomicU32,
    open_until: AtomicI64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { failures: AtomicU32::new(0), open_until: AtomicI64::new(0) }
    }

    fn is_open(&self) -> bool {
        crate::utils::now_secs() < self.open_until.load(Ordering::Acquire)
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= CIRCUIT_FAILURE_THRESHOLD {
            self.open_until.store(crate::utils::now_secs() + CIRCUIT_OPEN_SECS, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BoundRequest {
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

/// Substitutes `{name}` placeholders in `path_template`, lifts any
/// remaining parameter named `x-*` (case-insensitive) or `tenantId` into
/// headers, then splits what's left into query (GET/DELETE) or JSON body
/// (POST/PUT).
fn bind_request(
    path_template: &str,
    method: HttpMethod,
    mut parameters: Map<String, Value>,
) -> BoundRequest {
    let mut path = path_template.to_string();
    let placeholder_names: Vec<String> = parameters
        .keys()
        .filter(|name| path.contains(&format!("{{{name}}}")))
        .cloned()
        .collect();
    for name in placeholder_names {
        if let Some(value) = parameters.remove(&name) {
            let rendered = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string().trim_matches('"').to_string(),
            };
            path = path.replace(&format!("{{{name}}}"), &rendered);
        }
    }

    let mut headers = Vec::new();
    let header_names: Vec<String> = parameters
        .keys()
        .filter(|name| name.to_ascii_lowercase().starts_with("x-") || name.eq_ignore_ascii_case("tenantId"))
        .cloned()
        .collect();
    for name in header_names {
        if let Some(value) = parameters.remove(&name) {
            let rendered = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.push((name, rendered));
        }
    }

    match method {
        HttpMethod::Get | HttpMethod::Delete => {
            let query = parameters
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, value)
                })
                .collect();
            BoundRequest { path, headers, query, body: None }
        }
        HttpMethod::Post | HttpMethod::Put => {
            BoundRequest { path, headers, query: Vec::new(), body: Some(Value::Object(parameters)) }
        }
    }
}

/// Seam over tool execution that [`crate::agent::AgentLoop`] depends on
/// instead of the concrete gateway, the same way it depends on
/// [`crate::agent::Planner`] instead of a concrete LLM client — tests
/// substitute a fake returning canned [`ToolResult`]s so the loop's
/// tool-call branch can be exercised without a live upstream.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_def: &ToolDefinition, parameters: Value) -> Result<ToolResult>;
}

pub struct ToolGateway {
    http: reqwest::Client,
    base_url: String,
    static_token: Option<String>,
    oauth: Option<OAuth2Config>,
    token_state: Mutex<TokenState>,
    circuit: CircuitBreaker,
}

impl ToolGateway {
    pub fn new(base_url: impl Into<String>, static_token: Option<String>, oauth: Option<OAuth2Config>) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("gateway http client builds with static config");
        Self {
            http,
            base_url: base_url.into(),
            static_token,
            oauth,
            token_state: Mutex::new(TokenState::default()),
            circuit: CircuitBreaker::new(),
        }
    }

    /// Executes `tool_def` with `parameters`, returning a [`ToolResult`]
    /// that is never itself an `Err` for upstream/transport failures — only
    /// programmer errors (a non-object `parameters` value) surface as
    /// `Err`, per SPEC_FULL.md §4.6 mapping everything else into the
    /// result's own error shape.
    pub async fn execute(&self, tool_def: &ToolDefinition, parameters: Value) -> Result<ToolResult> {
        if self.circuit.is_open() {
            return Ok(ToolResult::error("upstream unavailable"));
        }

        let parameters = match parameters {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(Error::invalid_input("tool parameters must be a JSON object")),
        };

        let bound = bind_request(&tool_def.path_template, tool_def.http_method, parameters);
        let known_token = {
            let guard = self.token_state.lock().await;
            guard.access_token.clone()
        };

        match self.dispatch(tool_def.http_method, &bound, known_token.clone()).await {
            Ok(Dispatched::Response(outcome)) => {
                self.circuit.record_success();
                Ok(outcome)
            }
            Ok(Dispatched::Unauthorized) => {
                if self.oauth.is_none() {
                    return Ok(ToolResult::error_with_status(401, "unauthorized"));
                }
                let refreshed = match self.refresh_token(known_token).await {
                    Ok(token) => token,
                    Err(_) => return Ok(ToolResult::error("token refresh failed")),
                };
                match self.dispatch(tool_def.http_method, &bound, Some(refreshed)).await {
                    Ok(Dispatched::Response(outcome)) => {
                        self.circuit.record_success();
                        Ok(outcome)
                    }
                    Ok(Dispatched::Unauthorized) => Ok(ToolResult::error_with_status(401, "unauthorized")),
                    Ok(Dispatched::Failure(outcome)) => {
                        self.circuit.record_failure();
                        Ok(outcome)
                    }
                    Err(_) => {
                        self.circuit.record_failure();
                        Ok(ToolResult::error("network"))
                    }
                }
            }
            Ok(Dispatched::Failure(outcome)) => {
                self.circuit.record_failure();
                Ok(outcome)
            }
            Err(_) => {
                self.circuit.record_failure();
                Ok(ToolResult::error("network"))
            }
        }
    }

    async fn dispatch(
        &self,
        method: HttpMethod,
        bound: &BoundRequest,
        token: Option<String>,
    ) -> std::result::Result<Dispatched, reqwest::Error> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), bound.path);
        let mut request = self.http.request(method.as_reqwest(), url);

        let bearer = token.or_else(|| self.static_token.clone());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        for (name, value) in &bound.headers {
            request = request.header(name, value);
        }
        if !bound.query.is_empty() {
            request = request.query(&bound.query);
        }
        if let Some(body) = &bound.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.as_u16() == 401 {
            return Ok(Dispatched::Unauthorized);
        }

        if status.is_success() {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(Dispatched::Response(ToolResult::success(None)));
            }
            let data = serde_json::from_slice::<Value>(&bytes).ok();
            return Ok(Dispatched::Response(ToolResult::success(data)));
        }

        let status_code = status.as_u16();
        if status.is_server_error() {
            return Ok(Dispatched::Failure(ToolResult::error_with_status(status_code, "upstream server error")));
        }
        let body = response.text().await.unwrap_or_default();
        Ok(Dispatched::Response(ToolResult::error_with_status(status_code, body)))
    }

    /// Refreshes the OAuth2 token, guarded by `token_state`'s mutex so
    /// concurrent callers racing the same 401 share one token fetch: a
    /// caller that finds the token already changed since its own snapshot
    /// (`known_token`) just reuses the new one instead of re-fetching.
    async fn refresh_token(&self, known_token: Option<String>) -> Result<String> {
        let mut guard = self.token_state.lock().await;
        if guard.access_token != known_token {
            if let Some(token) = &guard.access_token {
                return Ok(token.clone());
            }
        }

        let cfg = self.oauth.as_ref().ok_or_else(|| Error::config("oauth2 not configured"))?;
        let mut form = vec![
            ("client_id", cfg.client_id.as_str()),
            ("client_secret", cfg.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        if let Some(scope) = &cfg.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self.http.post(&cfg.auth_url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(response.status().as_u16(), "oauth2 token refresh failed"));
        }
        let body: Value = response.json().await?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::llm("oauth2 response missing access_token"))?
            .to_string();

        guard.access_token = Some(token.clone());
        Ok(token)
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolGateway {
    async fn execute(&self, tool_def: &ToolDefinition, parameters: Value) -> Result<ToolResult> {
        ToolGateway::execute(self, tool_def, parameters).await
    }
}

enum Dispatched {
    Response(ToolResult),
    Unauthorized,
    Failure(ToolResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_request_substitutes_path_placeholder_and_consumes_it() {
        let params = json!({"plate": "ZG1234AB", "limit": 5}).as_object().unwrap().clone();
        let bound = bind_request("/vehicles/{plate}", HttpMethod::Get, params);
        assert_eq!(bound.path, "/vehicles/ZG1234AB");
        assert_eq!(bound.query, vec![("limit".to_string(), "5".to_string())]);
    }

    #[test]
    fn bind_request_lifts_x_prefixed_and_tenant_id_headers() {
        let params = json!({"x-trace-id": "abc", "tenantId": "t1", "q": "x"}).as_object().unwrap().clone();
        let bound = bind_request("/search", HttpMethod::Get, params);
        assert_eq!(bound.headers.len(), 2);
        assert!(bound.headers.iter().any(|(k, _)| k == "x-trace-id"));
        assert!(bound.headers.iter().any(|(k, _)| k == "tenantId"));
        assert_eq!(bound.query, vec![("q".to_string(), "x".to_string())]);
    }

    #[test]
    fn bind_request_sends_post_body_as_json_object() {
        let params = json!({"name": "Ana"}).as_object().unwrap().clone();
        let bound = bind_request("/users", HttpMethod::Post, params);
        assert!(bound.query.is_empty());
        assert_eq!(bound.body, Some(json!({"name": "Ana"})));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD {
            assert!(!breaker.is_open());
            breaker.record_failure();
        }
        assert!(breaker.is_open());
    }

    #[test]
    fn circuit_breaker_success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn oauth2_config_from_settings_requires_all_three_fields() {
        let mut settings = crate::config::Settings::for_tests();
        assert!(OAuth2Config::from_settings(&settings).is_none());
        settings.mobility_auth_url = Some("https://auth.example".into());
        settings.mobility_client_id = Some("id".into());
        settings.mobility_client_secret = Some("secret".into());
        assert!(OAuth2Config::from_settings(&settings).is_some());
    }
}
