//! `ToolRegistry`: turns an OpenAPI document into a searchable set of
//! LLM-callable operations (SPEC_FULL.md §4.3). Loads from a local path or
//! a URL, embeds each operation's description, answers top-k semantic
//! retrieval queries, and can hot-reload its source on an interval.

use crate::error::{Error, Result};
use crate::kv::Store;
use crate::types::{HttpMethod, ToolDefinition};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default number of tools returned by [`ToolRegistry::find_relevant_tools`].
pub const DEFAULT_TOP_K: usize = 3;
/// Similarity floor below which a candidate is dropped even if it's in the
/// top-k (SPEC_FULL.md §4.3).
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.25;
/// TTL for cached query embeddings.
const QUERY_EMBED_TTL_SECS: usize = 3600;
/// Default hot-reload interval.
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 300;

/// Embedding backend used both for tool descriptions at load time and for
/// queries at retrieval time. Implemented by [`crate::llm::LlmClient`];
/// tests substitute a deterministic fake.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Where an OpenAPI document comes from.
#[derive(Debug, Clone)]
pub enum OpenApiSource {
    File(PathBuf),
    Url(String),
}

#[derive(Debug, Deserialize)]
struct OpenApiDoc {
    paths: HashMap<String, Value>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenApiOperationSpec {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    #[serde(default)]
    parameters: Vec<OpenApiParameter>,
    #[serde(rename = "requestBody")]
    request_body: Option<OpenApiRequestBody>,
}

#[derive(Debug, Deserialize)]
struct OpenApiParameter {
    name: String,
    #[serde(rename = "in")]
    location: String,
    #[serde(default)]
    required: bool,
    schema: Option<Value>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenApiRequestBody {
    content: HashMap<String, OpenApiMediaType>,
}

#[derive(Debug, Deserialize)]
struct OpenApiMediaType {
    schema: Option<Value>,
}

const METHOD_KEYS: [(&str, HttpMethod); 4] = [
    ("get", HttpMethod::Get),
    ("post", HttpMethod::Post),
    ("put", HttpMethod::Put),
    ("delete", HttpMethod::Delete),
];

/// One immutable view of the registry's contents. Readers clone the `Arc`
/// at entry and use that snapshot for the rest of their call, so a
/// concurrent hot-reload swap never produces a half-old/half-new read.
#[derive(Debug, Default)]
struct Snapshot {
    by_op_id: HashMap<String, ToolDefinition>,
    tools: Vec<ToolDefinition>,
    /// Source fingerprint (ETag, Last-Modified, or content hash) used to
    /// detect change on hot-reload.
    fingerprint: Option<String>,
}

pub struct ToolRegistry {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    http: reqwest::Client,
    snapshot: RwLock<Arc<Snapshot>>,
    relevance_threshold: f32,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            http: reqwest::Client::new(),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            relevance_threshold: DEFAULT_RELEVANCE_THRESHOLD,
        }
    }

    pub fn with_relevance_threshold(mut self, threshold: f32) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    /// Number of operations currently registered.
    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads (or reloads) the registry from `source`. Builds the new
    /// `{op_id -> definition}` map and vector list off to the side, then
    /// swaps the snapshot reference in one step.
    pub async fn load(&self, source: &OpenApiSource) -> Result<()> {
        let (body, fingerprint) = self.fetch(source).await?;
        let doc: OpenApiDoc = serde_json::from_str(&body)?;

        let mut by_op_id = HashMap::new();
        let mut tools = Vec::new();

        for (path, path_item) in &doc.paths {
            for (method_key, method) in METHOD_KEYS {
                let Some(op_value) = path_item.get(method_key) else { continue };
                let spec: OpenApiOperationSpec = match serde_json::from_value(op_value.clone()) {
                    Ok(spec) => spec,
                    Err(_) => continue,
                };

                let operation_id = spec
                    .operation_id
                    .clone()
                    .unwrap_or_else(|| synthesize_operation_id(method_key, path));

                let description = build_description(&spec, method_key, path);
                let content_hash = crate::utils::content_hash(&description);

                let embedding = match self.cached_or_embed_tool(&operation_id, &content_hash, &description).await {
                    Ok(vec) => vec,
                    Err(_) => continue, // embedding failure: skip the tool, keep the rest operational
                };

                let llm_schema = build_llm_schema(&operation_id, &description, &spec);

                let definition = ToolDefinition {
                    operation_id: operation_id.clone(),
                    http_method: method,
                    path_template: path.clone(),
                    llm_schema,
                    embedding_vector: l2_normalize(&embedding),
                };
                by_op_id.insert(operation_id, definition.clone());
                tools.push(definition);
            }
        }

        let new_snapshot = Arc::new(Snapshot { by_op_id, tools, fingerprint });
        *self.snapshot.write().unwrap() = new_snapshot;
        Ok(())
    }

    async fn cached_or_embed_tool(&self, op_id: &str, content_hash: &str, description: &str) -> Result<Vec<f32>> {
        let cache_key = format!("tool_embed:{op_id}:{content_hash}");
        if let Some(cached) = self.store.get_string(&cache_key).await? {
            if let Ok(vector) = serde_json::from_str::<Vec<f32>>(&cached) {
                return Ok(vector);
            }
        }
        let vector = self.embedder.embed(description).await?;
        let encoded = serde_json::to_string(&vector)?;
        self.store.set_string(&cache_key, &encoded, None).await?;
        Ok(vector)
    }

    async fn cached_or_embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let cache_key = format!("query_embed:{}", crate::utils::content_hash(query));
        if let Some(cached) = self.store.get_string(&cache_key).await? {
            if let Ok(vector) = serde_json::from_str::<Vec<f32>>(&cached) {
                return Ok(vector);
            }
        }
        let vector = self.embedder.embed(query).await?;
        let encoded = serde_json::to_string(&vector)?;
        self.store.set_string(&cache_key, &encoded, Some(QUERY_EMBED_TTL_SECS)).await?;
        Ok(vector)
    }

    /// Embeds `query`, scores every registered tool by dot-product (both
    /// sides are L2-unit so this is cosine similarity), and returns the
    /// `llm_schema` of the top `top_k` tools clearing the relevance
    /// threshold, in descending order of similarity.
    pub async fn find_relevant_tools(&self, query: &str, top_k: usize) -> Result<Vec<Value>> {
        let query_vector = self.cached_or_embed_query(query).await?;
        let snapshot = self.snapshot.read().unwrap().clone();

        let mut scored: Vec<(f32, &ToolDefinition)> = snapshot
            .tools
            .iter()
            .map(|tool| (dot_product(&query_vector, &tool.embedding_vector), tool))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .filter(|(score, _)| *score >= self.relevance_threshold)
            .map(|(_, tool)| tool.llm_schema.clone())
            .collect())
    }

    pub fn get(&self, operation_id: &str) -> Option<ToolDefinition> {
        self.snapshot.read().unwrap().by_op_id.get(operation_id).cloned()
    }

    /// Issues HEAD (falling back to GET on 4xx/5xx) against a URL source,
    /// compares the fingerprint to the last load, and reloads only if it
    /// changed. A no-op for file sources — those are always reloaded when
    /// called, since there's no cheap conditional check available.
    pub async fn reload_if_changed(&self, source: &OpenApiSource) -> Result<bool> {
        match source {
            OpenApiSource::File(_) => {
                self.load(source).await?;
                Ok(true)
            }
            OpenApiSource::Url(url) => {
                let current = self.snapshot.read().unwrap().fingerprint.clone();
                let head_fingerprint = self.probe_fingerprint(url).await?;
                if head_fingerprint.is_some() && head_fingerprint == current {
                    return Ok(false);
                }
                self.load(source).await?;
                Ok(true)
            }
        }
    }

    async fn probe_fingerprint(&self, url: &str) -> Result<Option<String>> {
        let response = self.http.head(url).send().await?;
        if response.status().is_client_error() || response.status().is_server_error() {
            let response = self.http.get(url).send().await?;
            return Ok(fingerprint_from_headers(&response));
        }
        Ok(fingerprint_from_headers(&response))
    }

    async fn fetch(&self, source: &OpenApiSource) -> Result<(String, Option<String>)> {
        match source {
            OpenApiSource::File(path) => {
                let body = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::config(format!("reading OpenAPI file {}: {e}", path.display())))?;
                let fingerprint = crate::utils::content_hash(&body);
                Ok((body, Some(fingerprint)))
            }
            OpenApiSource::Url(url) => {
                let response = self.http.get(url).send().await?;
                if !response.status().is_success() {
                    return Err(Error::upstream(response.status().as_u16(), "fetching OpenAPI document"));
                }
                let fingerprint = fingerprint_from_headers(&response);
                let body = response.text().await?;
                let fingerprint = fingerprint.or_else(|| Some(crate::utils::content_hash(&body)));
                Ok((body, fingerprint))
            }
        }
    }

    /// Spawns a background task that calls [`Self::reload_if_changed`]
    /// every `interval_secs` seconds, logging and continuing on failure so
    /// a transient fetch error never takes the registry down.
    pub fn spawn_hot_reload(self: Arc<Self>, source: OpenApiSource, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                match self.reload_if_changed(&source).await {
                    Ok(true) => tracing::info!("tool registry hot-reloaded: source changed"),
                    Ok(false) => {}
                    Err(error) => tracing::warn!(%error, "tool registry hot-reload failed"),
                }
            }
        })
    }
}

fn fingerprint_from_headers(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::ETAG)
        .or_else(|| response.headers().get(reqwest::header::LAST_MODIFIED))
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
}

fn synthesize_operation_id(method: &str, path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{method}{sanitized}")
}

fn build_description(spec: &OpenApiOperationSpec, method: &str, path: &str) -> String {
    let mut parts = Vec::new();
    if let Some(summary) = &spec.summary {
        if !summary.is_empty() {
            parts.push(summary.clone());
        }
    }
    if let Some(description) = &spec.description {
        if !description.is_empty() {
            parts.push(description.clone());
        }
    }
    if parts.is_empty() {
        format!("{} {}", method.to_uppercase(), path)
    } else {
        parts.join(" ")
    }
}

fn build_llm_schema(operation_id: &str, description: &str, spec: &OpenApiOperationSpec) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in &spec.parameters {
        if param.location != "path" && param.location != "query" {
            continue;
        }
        let mut schema = param.schema.clone().unwrap_or_else(|| json!({"type": "string"}));
        if let Some(obj) = schema.as_object_mut() {
            if let Some(description) = &param.description {
                obj.entry("description").or_insert_with(|| json!(description));
            }
        }
        properties.insert(param.name.clone(), schema);
        if param.required {
            required.push(param.name.clone());
        }
    }

    if let Some(body) = &spec.request_body {
        for media_type in ["application/json", "application/x-www-form-urlencoded"] {
            let Some(media) = body.content.get(media_type) else { continue };
            let Some(schema) = &media.schema else { continue };
            merge_body_schema(schema, &mut properties, &mut required);
        }
    }

    json!({
        "type": "function",
        "function": {
            "name": operation_id,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": required,
            }
        }
    })
}

fn merge_body_schema(schema: &Value, properties: &mut Map<String, Value>, required: &mut Vec<String>) {
    let Some(obj) = schema.as_object() else { return };
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (name, prop_schema) in props {
            properties.entry(name.clone()).or_insert_with(|| prop_schema.clone());
        }
    }
    if let Some(req) = obj.get("required").and_then(Value::as_array) {
        for name in req {
            if let Some(name) = name.as_str() {
                if !required.contains(&name.to_string()) {
                    required.push(name.to_string());
                }
            }
        }
    }
}

pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm = (vector.iter().map(|x| x * x).sum::<f32>()).sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_operation_id_from_method_and_path() {
        assert_eq!(synthesize_operation_id("get", "/vehicles/{plate}"), "get_vehicles__plate_");
    }

    #[test]
    fn description_falls_back_to_method_and_path() {
        let spec = OpenApiOperationSpec::default();
        assert_eq!(build_description(&spec, "get", "/vehicles"), "GET /vehicles");
    }

    #[test]
    fn description_concatenates_summary_and_description() {
        let spec = OpenApiOperationSpec {
            summary: Some("Get vehicle".to_string()),
            description: Some("Returns current location".to_string()),
            ..Default::default()
        };
        assert_eq!(build_description(&spec, "get", "/v"), "Get vehicle Returns current location");
    }

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let v = l2_normalize(&[3.0, 4.0]);
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dot_product_of_unit_vectors_is_cosine_similarity() {
        let a = l2_normalize(&[1.0, 0.0]);
        let b = l2_normalize(&[1.0, 1.0]);
        let sim = dot_product(&a, &b);
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn llm_schema_merges_path_query_and_body_params() {
        let spec = OpenApiOperationSpec {
            operation_id: Some("get_vehicle".into()),
            parameters: vec![
                OpenApiParameter {
                    name: "plate".into(),
                    location: "path".into(),
                    required: true,
                    schema: Some(json!({"type": "string"})),
                    description: None,
                },
                OpenApiParameter {
                    name: "verbose".into(),
                    location: "query".into(),
                    required: false,
                    schema: Some(json!({"type": "boolean"})),
                    description: None,
                },
            ],
            ..Default::default()
        };
        let schema = build_llm_schema("get_vehicle", "Get vehicle", &spec);
        let params = &schema["function"]["parameters"];
        assert!(params["properties"]["plate"].is_object());
        assert!(params["properties"]["verbose"].is_object());
        assert_eq!(params["required"], json!(["plate"]));
    }
}
