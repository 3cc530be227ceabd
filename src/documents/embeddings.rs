//! Embeddings
//!
//! Maps text to a fixed-length vector through the configured external
//! provider, substituting a deterministic local generator when no credential
//! is set or the provider call fails.
//!
//! The local generator seeds a PRNG from a hash of the text and mixes in token
//! count, length and character codes. It is reproducible for identical input
//! but carries no semantic signal: rankings computed from it are internally
//! consistent and nothing more.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EmbeddingSettings, ProviderConfig, ProviderKind};

/// Embedding vector
pub type Embedding = Vec<f32>;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Http(String),
    #[error("Embedding provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed embedding response: {0}")]
    Malformed(String),
    #[error("Embedding cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        EmbeddingError::Http(e.to_string())
    }
}

/// Where a vector came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEmbedding {
    pub values: Embedding,
    pub source: EmbeddingSource,
}

// ── Provider request/response shapes ───────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest<'a> {
    model: String,
    content: GeminiContent<'a>,
    output_dimensionality: usize,
}

#[derive(Deserialize)]
struct GeminiEmbedResponse {
    embedding: GeminiEmbeddingValues,
}

#[derive(Deserialize)]
struct GeminiEmbeddingValues {
    values: Vec<f32>,
}

/// Request body for the selected provider
enum EmbeddingRequest<'a> {
    OpenAi(OpenAiEmbeddingRequest<'a>),
    Gemini(GeminiEmbedRequest<'a>),
}

impl<'a> EmbeddingRequest<'a> {
    fn build(provider: &'a ProviderConfig, text: &'a str, dimensions: usize) -> Self {
        let model = provider.embedding_model();
        match provider.kind {
            ProviderKind::OpenAi => EmbeddingRequest::OpenAi(OpenAiEmbeddingRequest {
                model,
                input: text,
                // Only the text-embedding-3 family accepts a dimension override
                dimensions: model.starts_with("text-embedding-3").then_some(dimensions),
            }),
            ProviderKind::Gemini => EmbeddingRequest::Gemini(GeminiEmbedRequest {
                model: format!("models/{}", model.trim_start_matches("models/")),
                content: GeminiContent { parts: vec![GeminiPart { text }] },
                output_dimensionality: dimensions,
            }),
        }
    }

    async fn send(
        &self,
        http: &reqwest::Client,
        provider: &ProviderConfig,
        key: &str,
    ) -> Result<Embedding, EmbeddingError> {
        let base = provider.base_url();
        let response = match self {
            EmbeddingRequest::OpenAi(body) => {
                http.post(format!("{}/embeddings", base))
                    .bearer_auth(key)
                    .json(body)
                    .send()
                    .await?
            }
            EmbeddingRequest::Gemini(body) => {
                http.post(format!("{}/{}:embedContent", base, body.model))
                    .header("x-goog-api-key", key)
                    .json(body)
                    .send()
                    .await?
            }
        };

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EmbeddingError::Status { status: status.as_u16(), body: text });
        }

        let values = match self {
            EmbeddingRequest::OpenAi(_) => {
                let parsed: OpenAiEmbeddingResponse = serde_json::from_str(&text)
                    .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
                parsed.data.into_iter().next()
                    .map(|d| d.embedding)
                    .ok_or_else(|| EmbeddingError::Malformed("empty data array".to_string()))?
            }
            EmbeddingRequest::Gemini(_) => {
                let parsed: GeminiEmbedResponse = serde_json::from_str(&text)
                    .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
                parsed.embedding.values
            }
        };

        Ok(values)
    }
}

// ── Local generator ────────────────────────────────────────────────

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic, non-semantic embedding of `text`.
///
/// Identical input always yields a bit-identical vector. The result is
/// L2-normalized unless its norm is zero.
pub fn local_embedding(text: &str, dimensions: usize) -> Embedding {
    let mut rng = StdRng::seed_from_u64(hash_text(text));
    let token_count = text.split_whitespace().count() as f32;
    let codes: Vec<u32> = text.chars().map(|c| c as u32).collect();
    let length = codes.len() as f32;

    let mut values: Embedding = (0..dimensions)
        .map(|i| {
            let phase = (i + 1) as f32;
            let token_term = (token_count * phase * 0.01).sin();
            let length_term = (length * phase * 0.001).cos();
            let noise: f32 = rng.gen_range(-1.0..1.0);
            let char_term = if codes.is_empty() {
                0.0
            } else {
                (codes[i % codes.len()] % 256) as f32 / 127.5 - 1.0
            };
            0.2 * token_term + 0.2 * length_term + 0.3 * noise + 0.3 * char_term
        })
        .collect();

    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut values {
            *x /= norm;
        }
    }
    values
}

// ── Embedder ───────────────────────────────────────────────────────

struct EmbedderState {
    provider: ProviderConfig,
    settings: EmbeddingSettings,
    http: reqwest::Client,
}

impl EmbedderState {
    fn new(provider: ProviderConfig, settings: EmbeddingSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(provider.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { provider, settings, http }
    }
}

/// Text → vector, remote when configured, local otherwise.
///
/// With `fallback_on_error` set (the default), [`Embedder::embed`] never
/// returns an error: any provider failure is logged and answered with the
/// local generator.
pub struct Embedder {
    state: RwLock<EmbedderState>,
}

impl Embedder {
    pub fn new(provider: ProviderConfig, settings: EmbeddingSettings) -> Self {
        Self { state: RwLock::new(EmbedderState::new(provider, settings)) }
    }

    /// Embedder that never calls out
    pub fn local(dimensions: usize) -> Self {
        let settings = EmbeddingSettings { dimensions, ..EmbeddingSettings::default() };
        Self::new(ProviderConfig::default(), settings)
    }

    /// Replace provider configuration; subsequent calls use the new values
    pub fn reload(&self, provider: ProviderConfig, settings: EmbeddingSettings) {
        debug!(provider = provider.kind.as_str(), configured = provider.is_configured(), "Reloading embedder");
        *self.state.write() = EmbedderState::new(provider, settings);
    }

    pub fn dimensions(&self) -> usize {
        self.state.read().settings.dimensions
    }

    pub fn uses_remote(&self) -> bool {
        self.state.read().provider.is_configured()
    }

    fn snapshot(&self) -> (ProviderConfig, EmbeddingSettings, reqwest::Client) {
        let state = self.state.read();
        (state.provider.clone(), state.settings.clone(), state.http.clone())
    }

    /// Call the provider without the fallback policy
    pub async fn embed_remote(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let (provider, settings, http) = self.snapshot();
        let key = provider.credential()
            .ok_or_else(|| EmbeddingError::Http("no API key configured".to_string()))?;
        request_embedding(&http, &provider, key, text, settings.dimensions).await
    }

    /// Embed one text according to the configured policy
    pub async fn embed(&self, text: &str) -> Result<GeneratedEmbedding, EmbeddingError> {
        let (provider, settings, http) = self.snapshot();
        let dimensions = settings.dimensions;

        let key = match provider.credential() {
            Some(key) => key,
            None => {
                return Ok(GeneratedEmbedding {
                    values: local_embedding(text, dimensions),
                    source: EmbeddingSource::Local,
                })
            }
        };

        match request_embedding(&http, &provider, key, text, dimensions).await {
            Ok(values) => Ok(GeneratedEmbedding { values, source: EmbeddingSource::Remote }),
            Err(e) if settings.fallback_on_error => {
                warn!(provider = provider.kind.as_str(), error = %e, "Embedding provider failed, using local fallback");
                Ok(GeneratedEmbedding {
                    values: local_embedding(text, dimensions),
                    source: EmbeddingSource::Local,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Embed texts one at a time, reporting `(current, total)` after each.
    ///
    /// Remote calls are spaced by `batch_delay_ms`. Cancellation is checked
    /// before every item and during the delay.
    pub async fn embed_batch(
        &self,
        texts: &[&str],
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<Vec<GeneratedEmbedding>, EmbeddingError> {
        let total = texts.len();
        let delay = Duration::from_millis(self.state.read().settings.batch_delay_ms);
        let mut results = Vec::with_capacity(total);

        for (i, text) in texts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EmbeddingError::Cancelled);
            }

            results.push(self.embed(text).await?);
            on_progress(i + 1, total);

            if i + 1 < total && !delay.is_zero() && self.uses_remote() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
                }
            }
        }

        Ok(results)
    }
}

async fn request_embedding(
    http: &reqwest::Client,
    provider: &ProviderConfig,
    key: &str,
    text: &str,
    dimensions: usize,
) -> Result<Embedding, EmbeddingError> {
    debug!(provider = provider.kind.as_str(), text_len = text.len(), "Requesting embedding");
    let values = EmbeddingRequest::build(provider, text, dimensions)
        .send(http, provider, key)
        .await?;

    if values.len() != dimensions {
        return Err(EmbeddingError::Malformed(format!(
            "expected {} dimensions, got {}",
            dimensions,
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::Malformed("non-finite component".to_string()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port_url, stub_server};

    fn remote_provider(kind: ProviderKind, base_url: String) -> ProviderConfig {
        ProviderConfig {
            kind,
            api_key: Some("test-key".to_string()),
            base_url: Some(base_url),
            timeout_secs: 5,
            ..ProviderConfig::default()
        }
    }

    fn settings(dimensions: usize, fallback_on_error: bool) -> EmbeddingSettings {
        EmbeddingSettings { dimensions, fallback_on_error, batch_delay_ms: 0 }
    }

    #[test]
    fn test_local_embedding_dimensions() {
        let embedding = local_embedding("Hello world this is a test", 1536);
        assert_eq!(embedding.len(), 1536);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_local_embedding_deterministic() {
        let first = local_embedding("The quick brown fox", 256);
        let _ = local_embedding("completely different words zebra giraffe quantum", 256);
        let second = local_embedding("The quick brown fox", 256);

        let first_bits: Vec<u32> = first.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
    }

    #[test]
    fn test_local_embedding_differs_by_text() {
        assert_ne!(local_embedding("alpha", 64), local_embedding("beta", 64));
    }

    #[test]
    fn test_local_embedding_zero_dimensions() {
        assert!(local_embedding("anything", 0).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_uses_local() {
        let embedder = Embedder::local(32);
        let result = embedder.embed("some text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Local);
        assert_eq!(result.values, local_embedding("some text", 32));
    }

    #[tokio::test]
    async fn test_transport_failure_falls_back() {
        let embedder = Embedder::new(
            remote_provider(ProviderKind::OpenAi, closed_port_url().await),
            settings(16, true),
        );
        let result = embedder.embed("offline text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Local);
        assert_eq!(result.values, local_embedding("offline text", 16));
    }

    #[tokio::test]
    async fn test_error_status_falls_back() {
        let url = stub_server("500 Internal Server Error", r#"{"error":{"message":"boom"}}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(16, true));
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Local);
    }

    #[tokio::test]
    async fn test_malformed_body_falls_back() {
        let url = stub_server("200 OK", r#"{"unexpected": true}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(16, true));
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Local);
    }

    #[tokio::test]
    async fn test_wrong_dimension_falls_back() {
        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0.1,0.2]}]}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(4, true));
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Local);
        assert_eq!(result.values.len(), 4);
    }

    #[tokio::test]
    async fn test_strict_policy_surfaces_errors() {
        let url = stub_server("503 Service Unavailable", "overloaded").await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(4, false));
        match embedder.embed("text").await {
            Err(EmbeddingError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_openai_success() {
        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0.5,0.5,0.5,0.5]}]}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(4, true));
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Remote);
        assert_eq!(result.values, vec![0.5, 0.5, 0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_gemini_success() {
        let url = stub_server("200 OK", r#"{"embedding":{"values":[1.0,0.0,0.0]}}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::Gemini, url), settings(3, true));
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Remote);
        assert_eq!(result.values, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gemini_request_uses_gemini_model() {
        let mut provider = ProviderConfig { kind: ProviderKind::Gemini, ..ProviderConfig::default() };
        let EmbeddingRequest::Gemini(body) = EmbeddingRequest::build(&provider, "text", 768) else {
            panic!("expected gemini request")
        };
        assert_eq!(body.model, "models/gemini-embedding-001");
        assert_eq!(body.output_dimensionality, 768);

        provider.embedding_model = Some("models/text-embedding-004".to_string());
        let EmbeddingRequest::Gemini(body) = EmbeddingRequest::build(&provider, "text", 768) else {
            panic!("expected gemini request")
        };
        assert_eq!(body.model, "models/text-embedding-004");
    }

    #[tokio::test]
    async fn test_embed_remote_skips_fallback() {
        let url = stub_server("500 Internal Server Error", "upstream down").await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(4, true));
        match embedder.embed_remote("text").await {
            Err(EmbeddingError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "upstream down");
            }
            other => panic!("expected status error, got {:?}", other),
        }

        let unconfigured = Embedder::local(4);
        assert!(matches!(unconfigured.embed_remote("text").await, Err(EmbeddingError::Http(_))));
    }

    #[tokio::test]
    async fn test_embed_remote_returns_vector() {
        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0.0,1.0,0.0,0.0]}]}"#).await;
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), settings(4, false));
        assert_eq!(embedder.embed_remote("text").await.unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_reload_switches_provider() {
        let embedder = Embedder::local(8);
        assert!(!embedder.uses_remote());

        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0,0,0,1]}]}"#).await;
        embedder.reload(remote_provider(ProviderKind::OpenAi, url), settings(4, true));
        assert!(embedder.uses_remote());
        assert_eq!(embedder.dimensions(), 4);
        let result = embedder.embed("text").await.unwrap();
        assert_eq!(result.source, EmbeddingSource::Remote);
    }

    #[tokio::test]
    async fn test_embed_batch_reports_progress() {
        let embedder = Embedder::local(8);
        let cancel = CancellationToken::new();
        let mut progress = Vec::new();

        let results = embedder
            .embed_batch(&["one", "two", "three"], &cancel, |current, total| progress.push((current, total)))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_embed_batch_cancelled() {
        let embedder = Embedder::local(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = embedder.embed_batch(&["one", "two"], &cancel, |_, _| {}).await;
        assert!(matches!(result, Err(EmbeddingError::Cancelled)));
    }

    #[tokio::test]
    async fn test_embed_batch_cancelled_after_first_item() {
        let embedder = Embedder::local(8);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut progress = Vec::new();

        let result = embedder
            .embed_batch(&["one", "two", "three"], &cancel, |current, total| {
                progress.push((current, total));
                trigger.cancel();
            })
            .await;

        assert!(matches!(result, Err(EmbeddingError::Cancelled)));
        assert_eq!(progress, vec![(1, 3)]);
    }

    #[tokio::test]
    async fn test_batch_delay_spaces_remote_calls() {
        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0.5,0.5,0.5,0.5]}]}"#).await;
        let delayed = EmbeddingSettings { batch_delay_ms: 150, ..settings(4, false) };
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), delayed);

        let started = std::time::Instant::now();
        let results = embedder
            .embed_batch(&["one", "two", "three"], &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.source == EmbeddingSource::Remote));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_batch_delay() {
        let url = stub_server("200 OK", r#"{"data":[{"embedding":[0.5,0.5,0.5,0.5]}]}"#).await;
        let delayed = EmbeddingSettings { batch_delay_ms: 10_000, ..settings(4, false) };
        let embedder = Embedder::new(remote_provider(ProviderKind::OpenAi, url), delayed);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut progress = Vec::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = embedder
            .embed_batch(&["one", "two"], &cancel, |current, total| progress.push((current, total)))
            .await;

        assert!(matches!(result, Err(EmbeddingError::Cancelled)));
        assert_eq!(progress, vec![(1, 2)]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
