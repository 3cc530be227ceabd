//! Configuration
//!
//! Provider credentials, embedding, chunking and retrieval settings. A `Config`
//! is an explicit value handed to each component at construction; components
//! expose `reload` to swap it out instead of reading global state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Application identifier used for the data directory
const APP_IDENTIFIER: &str = "docent";

/// Default embedding dimensionality (matches `text-embedding-3-small`)
pub const DEFAULT_DIMENSIONS: usize = 1536;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("App data directory not found")]
    NoDataDir,
}

/// External provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::OpenAi
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            other => Err(ConfigError::Invalid(format!("Unknown provider: {}", other))),
        }
    }
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn default_embedding_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "text-embedding-3-small",
            ProviderKind::Gemini => "gemini-embedding-001",
        }
    }

    pub fn default_generation_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Gemini => "gemini-2.0-flash",
        }
    }

    /// Provider that serves a well-known model name; `None` for names we
    /// don't recognize (custom gateways, fine-tunes)
    pub fn for_model(model: &str) -> Option<Self> {
        let model = model.trim_start_matches("models/");
        const OPENAI: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-", "text-embedding-3", "text-embedding-ada"];
        const GEMINI: &[&str] = &["gemini", "text-embedding-004", "embedding-001"];
        if OPENAI.iter().any(|p| model.starts_with(p)) {
            Some(ProviderKind::OpenAi)
        } else if GEMINI.iter().any(|p| model.starts_with(p)) {
            Some(ProviderKind::Gemini)
        } else {
            None
        }
    }
}

/// Output sizes a known embedding model can produce
pub fn embedding_dimension_range(model: &str) -> Option<RangeInclusive<usize>> {
    match model.trim_start_matches("models/") {
        // ada-002 ignores the dimensions parameter
        "text-embedding-ada-002" => Some(1536..=1536),
        "text-embedding-3-small" => Some(1..=1536),
        "text-embedding-3-large" => Some(1..=3072),
        "gemini-embedding-001" => Some(1..=3072),
        "text-embedding-004" | "embedding-001" => Some(1..=768),
        _ => None,
    }
}

/// Credentials and model selection for the external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Falls back to the provider kind's default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
    /// Overrides the provider's public endpoint (proxies, local gateways)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_key: None,
            embedding_model: None,
            generation_model: None,
            base_url: None,
            timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    /// The configured key, treating blank strings as absent
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn is_configured(&self) -> bool {
        self.credential().is_some()
    }

    pub fn embedding_model(&self) -> &str {
        non_blank(self.embedding_model.as_deref()).unwrap_or(self.kind.default_embedding_model())
    }

    pub fn generation_model(&self) -> &str {
        non_blank(self.generation_model.as_deref()).unwrap_or(self.kind.default_generation_model())
    }

    pub fn base_url(&self) -> &str {
        match self.base_url.as_deref() {
            Some(url) => url.trim_end_matches('/'),
            None => match self.kind {
                ProviderKind::OpenAi => "https://api.openai.com/v1",
                ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            },
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingSettings {
    pub dimensions: usize,
    /// Substitute the local generator when the provider fails
    pub fallback_on_error: bool,
    /// Pause between sequential provider calls
    pub batch_delay_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            fallback_on_error: true,
            batch_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkingSettings {
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Characters carried over from the previous chunk
    pub overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { chunk_size: 1000, overlap: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub threshold: f32,
    pub context_token_budget: u32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: 0.0,
            context_token_budget: 4_000,
        }
    }
}

/// Full application configuration persisted to preferences.json
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

/// Get the app data directory (no UI handle needed)
pub fn app_data_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
    Ok(base.join(APP_IDENTIFIER))
}

/// Location of the preferences file
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(app_data_dir()?.join("config").join("preferences.json"))
}

/// Atomic write: write to a .tmp sibling then rename into place.
fn atomic_write(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&config_path()?)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        atomic_write(path, &content)
    }

    /// Apply `DOCENT_*` environment variables on top of file values
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("DOCENT_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(kind) = lookup("DOCENT_PROVIDER") {
            match kind.parse() {
                Ok(kind) => self.provider.kind = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring DOCENT_PROVIDER"),
            }
        }
        if let Some(model) = lookup("DOCENT_EMBEDDING_MODEL") {
            self.provider.embedding_model = Some(model);
        }
        if let Some(model) = lookup("DOCENT_GENERATION_MODEL") {
            self.provider.generation_model = Some(model);
        }
        if let Some(url) = lookup("DOCENT_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(db) = lookup("DOCENT_DB") {
            self.database_path = Some(PathBuf::from(db));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunkSize must be greater than zero".to_string()));
        }
        if chunking.overlap >= chunking.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "overlap ({}) must be less than chunkSize ({})",
                chunking.overlap, chunking.chunk_size
            )));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid("dimensions must be greater than zero".to_string()));
        }
        let provider = &self.provider;
        for model in [provider.embedding_model(), provider.generation_model()] {
            if let Some(owner) = ProviderKind::for_model(model) {
                if owner != provider.kind {
                    return Err(ConfigError::Invalid(format!(
                        "model {} is served by {}, not {}",
                        model,
                        owner.as_str(),
                        provider.kind.as_str()
                    )));
                }
            }
        }
        if let Some(range) = embedding_dimension_range(provider.embedding_model()) {
            if !range.contains(&self.embedding.dimensions) {
                return Err(ConfigError::Invalid(format!(
                    "{} cannot produce {} dimensions (supported: {}..={})",
                    provider.embedding_model(),
                    self.embedding.dimensions,
                    range.start(),
                    range.end()
                )));
            }
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("topK must be greater than zero".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold ({}) must be within [-1, 1]",
                self.retrieval.threshold
            )));
        }
        Ok(())
    }

    /// Database file, defaulting to the app data directory
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(app_data_dir()?.join("documents.db")),
        }
    }
}
