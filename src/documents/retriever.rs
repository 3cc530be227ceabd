//! Document Retrieval
//!
//! Orchestrates ingest (extract → chunk → embed → store) and query
//! (embed → rank → assemble context → generate). Every step of one
//! invocation runs sequentially; store access goes through
//! `spawn_blocking`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::chunker::{Chunk, Chunker};
use super::embeddings::{Embedder, EmbeddingError, EmbeddingSource, GeneratedEmbedding};
use super::extract::{ExtractError, PlainTextExtractor, TextExtractor};
use super::similarity::{top_k, SimilarityError};
use super::store::{Document, DocumentInfo, DocumentStore, StoreError, StoreStats};
use crate::config::{ChunkingSettings, Config, ConfigError, RetrievalSettings};
use crate::generation::{Conversation, GenerationClient, GenerationError};
use crate::tokens::count_tokens;

/// Separator between context blocks
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Error, Debug)]
pub enum RetrieverError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Similarity error: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Operation cancelled")]
    Cancelled,
}

impl Serialize for RetrieverError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RetrieverError>;

/// A ranked chunk with a snapshot of its document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk: Chunk,
    pub document: DocumentInfo,
    pub score: f32,
}

impl SearchResult {
    pub fn relevance_percent(&self) -> i32 {
        (self.score * 100.0).round() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Complete,
}

/// Status update emitted while ingesting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgress {
    pub stage: IngestStage,
    pub message: String,
    /// Set for iterative stages, in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f32>,
}

impl IngestProgress {
    fn status(stage: IngestStage, message: impl Into<String>) -> Self {
        Self { stage, message: message.into(), fraction: None }
    }

    fn step(stage: IngestStage, message: impl Into<String>, current: usize, total: usize) -> Self {
        let fraction = if total == 0 { 1.0 } else { current as f32 / total as f32 };
        Self { stage, message: message.into(), fraction: Some(fraction) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document: DocumentInfo,
    pub chunks: usize,
    /// Chunks embedded by the local generator instead of the provider
    pub local_embeddings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReembedReport {
    pub chunks: usize,
    pub dimensions: usize,
    pub local_embeddings: usize,
}

/// Generated reply with the material it was grounded on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SearchResult>,
    pub context: String,
}

/// Join ranked hits into context blocks, stopping before `token_budget` is
/// exceeded. The first hit is always included.
pub fn build_context(results: &[SearchResult], token_budget: u32) -> String {
    let separator_tokens = count_tokens(CONTEXT_SEPARATOR);
    let mut blocks = Vec::new();
    let mut used = 0u32;

    for result in results {
        let block = format!(
            "[Source: {} | Relevance: {}%]\n{}",
            result.document.name,
            result.relevance_percent(),
            result.chunk.content
        );
        let cost = count_tokens(&block) + if blocks.is_empty() { 0 } else { separator_tokens };
        if !blocks.is_empty() && used + cost > token_budget {
            break;
        }
        used += cost;
        blocks.push(block);
    }

    debug!(blocks = blocks.len(), tokens = used, "Assembled context");
    blocks.join(CONTEXT_SEPARATOR)
}

fn system_prompt(context: &str) -> String {
    let context = if context.is_empty() {
        "No relevant documents were found."
    } else {
        context
    };
    format!(
        "You are a research assistant answering questions about the user's documents.\n\
         Ground your answer in the excerpts below and cite sources by name.\n\
         If the excerpts do not contain the answer, say so.\n\n\
         Document excerpts:\n\n{}",
        context
    )
}

#[derive(Debug, Clone)]
struct PipelineSettings {
    chunking: ChunkingSettings,
    retrieval: RetrievalSettings,
}

/// Ingest and query over one document store
pub struct RetrievalPipeline {
    store: Arc<DocumentStore>,
    embedder: Embedder,
    generator: GenerationClient,
    extractor: Arc<dyn TextExtractor>,
    settings: RwLock<PipelineSettings>,
}

impl RetrievalPipeline {
    pub fn new(config: &Config, store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            embedder: Embedder::new(config.provider.clone(), config.embedding.clone()),
            generator: GenerationClient::new(config.provider.clone()),
            extractor: Arc::new(PlainTextExtractor),
            settings: RwLock::new(PipelineSettings {
                chunking: config.chunking.clone(),
                retrieval: config.retrieval.clone(),
            }),
        }
    }

    /// Open the store at the configured database path
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let store = DocumentStore::open(config.database_path()?)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Apply new provider, chunking and retrieval settings. The store is kept.
    pub fn reload(&self, config: &Config) -> Result<()> {
        config.validate()?;
        self.embedder.reload(config.provider.clone(), config.embedding.clone());
        self.generator.reload(config.provider.clone());
        *self.settings.write() = PipelineSettings {
            chunking: config.chunking.clone(),
            retrieval: config.retrieval.clone(),
        };
        info!(provider = config.provider.kind.as_str(), "Pipeline configuration reloaded");
        Ok(())
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        self.settings.read().retrieval.clone()
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(StoreError::from)?;
        Ok(result?)
    }

    // ── Ingest ─────────────────────────────────────────────────────

    /// Extract a file and ingest its text. `name` defaults to the file name.
    pub async fn ingest_file(
        &self,
        path: &Path,
        name: Option<&str>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(IngestProgress),
    ) -> Result<IngestReport> {
        let display = path.display().to_string();
        on_progress(IngestProgress::step(IngestStage::Extracting, format!("Reading {}", display), 0, 1));

        let extractor = Arc::clone(&self.extractor);
        let owned: PathBuf = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&owned))
            .await
            .map_err(StoreError::from)??;
        on_progress(IngestProgress::step(
            IngestStage::Extracting,
            format!("Extracted {} page(s)", extracted.page_count),
            1,
            1,
        ));

        let name = name
            .map(str::to_string)
            .or_else(|| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .unwrap_or_else(|| display.clone());

        let mut report = self
            .ingest_text(&name, &display, &extracted.text, cancel, on_progress)
            .await?;
        report.page_count = Some(extracted.page_count);
        Ok(report)
    }

    /// Chunk, embed and store `content`. Nothing is written unless every
    /// step succeeds.
    pub async fn ingest_text(
        &self,
        name: &str,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(IngestProgress),
    ) -> Result<IngestReport> {
        if content.trim().is_empty() {
            return Err(RetrieverError::Validation(format!("{} has no text content", name)));
        }
        if cancel.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        on_progress(IngestProgress::status(IngestStage::Chunking, "Splitting into chunks"));
        let chunker = Chunker::from_settings(&self.settings.read().chunking);
        let mut document = Document::new(name, path, content);
        document.chunks = chunker.chunk(&document.id, content);
        if document.chunks.is_empty() {
            return Err(RetrieverError::Validation(format!("{} has no chunkable sentences", name)));
        }

        let total = document.chunks.len();
        on_progress(IngestProgress::step(IngestStage::Embedding, format!("Embedding {} chunks", total), 0, total));
        let texts: Vec<&str> = document.chunks.iter().map(|c| c.content.as_str()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts, cancel, |current, total| {
                on_progress(IngestProgress::step(
                    IngestStage::Embedding,
                    format!("Embedded chunk {}/{}", current, total),
                    current,
                    total,
                ));
            })
            .await
            .map_err(cancelled_or)?;

        let local_embeddings = count_local(&embeddings);
        for (chunk, embedding) in document.chunks.iter_mut().zip(embeddings) {
            chunk.embedding = embedding.values;
        }

        if cancel.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        on_progress(IngestProgress::status(IngestStage::Storing, "Saving document"));
        let info = document.info();
        self.with_store(move |store| store.store(&document)).await?;

        info!(
            doc_id = %info.id,
            name = %info.name,
            chunks = total,
            local_embeddings,
            "Ingested document"
        );
        on_progress(IngestProgress::status(IngestStage::Complete, format!("Ingested {}", info.name)));

        Ok(IngestReport { document: info, chunks: total, local_embeddings, page_count: None })
    }

    // ── Query ──────────────────────────────────────────────────────

    /// Top `k` chunks scoring at least `threshold` against `query`
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(RetrieverError::Validation("query is empty".to_string()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await.map_err(cancelled_or)?;
        if cancel.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        let candidates = self.with_store(|store| store.search_candidates()).await?;
        if let Some((first, _)) = candidates.first() {
            if first.embedding.len() != query_embedding.values.len() {
                return Err(StoreError::DimensionMismatch {
                    expected: first.embedding.len(),
                    actual: query_embedding.values.len(),
                }
                .into());
            }
        }

        let ranked = top_k(
            &query_embedding.values,
            candidates.iter().map(|(chunk, _)| chunk.embedding.as_slice()),
            k,
            threshold,
            cancel,
        )
        .map_err(|e| match e {
            SimilarityError::Cancelled => RetrieverError::Cancelled,
            other => other.into(),
        })?;

        let results: Vec<SearchResult> = ranked
            .into_iter()
            .map(|scored| {
                let (chunk, document) = candidates[scored.position].clone();
                SearchResult { chunk, document, score: scored.score }
            })
            .collect();

        info!(
            candidates = candidates.len(),
            hits = results.len(),
            source = ?query_embedding.source,
            "Search complete"
        );
        Ok(results)
    }

    /// Search with the configured `top_k` and threshold
    pub async fn retrieve(&self, query: &str, cancel: &CancellationToken) -> Result<Vec<SearchResult>> {
        let settings = self.retrieval_settings();
        self.search(query, settings.top_k, settings.threshold, cancel).await
    }

    /// Answer `query` from retrieved context. The exchange is appended to
    /// `conversation` only when generation succeeds.
    pub async fn ask(
        &self,
        conversation: &mut Conversation,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let sources = self.retrieve(query, cancel).await?;
        let context_budget = self.retrieval_settings().context_token_budget;
        let context = build_context(&sources, context_budget);
        let system = system_prompt(&context);

        let text = tokio::select! {
            reply = self.generator.generate(&system, conversation.turns(), query) => reply?,
            _ = cancel.cancelled() => return Err(RetrieverError::Cancelled),
        };

        conversation.push_exchange(query, text.clone());
        info!(sources = sources.len(), turns = conversation.len(), "Answered query");
        Ok(Answer { text, sources, context })
    }

    /// Recompute every stored embedding with the current provider
    pub async fn reembed_all(
        &self,
        cancel: &CancellationToken,
        on_progress: impl FnMut(usize, usize),
    ) -> Result<ReembedReport> {
        let candidates = self.with_store(|store| store.search_candidates()).await?;
        let dimensions = self.embedder.dimensions();
        if candidates.is_empty() {
            return Ok(ReembedReport { chunks: 0, dimensions, local_embeddings: 0 });
        }

        let texts: Vec<&str> = candidates.iter().map(|(c, _)| c.content.as_str()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts, cancel, on_progress)
            .await
            .map_err(cancelled_or)?;
        if cancel.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        let local_embeddings = count_local(&embeddings);
        let updates: Vec<(String, Vec<f32>)> = candidates
            .iter()
            .zip(embeddings)
            .map(|((chunk, _), embedding)| (chunk.id.clone(), embedding.values))
            .collect();
        let chunks = updates.len();
        self.with_store(move |store| store.replace_embeddings(&updates)).await?;

        info!(chunks, dimensions, local_embeddings, "Re-embedded corpus");
        Ok(ReembedReport { chunks, dimensions, local_embeddings })
    }

    // ── Store passthroughs ─────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<DocumentInfo>> {
        self.with_store(|store| store.list()).await
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let id = id.to_string();
        self.with_store(move |store| store.get(&id)).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_store(move |store| store.delete(&id)).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.with_store(|store| store.clear()).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.with_store(|store| store.stats()).await
    }
}

fn count_local(embeddings: &[GeneratedEmbedding]) -> usize {
    embeddings.iter().filter(|e| e.source == EmbeddingSource::Local).count()
}

fn cancelled_or(e: EmbeddingError) -> RetrieverError {
    match e {
        EmbeddingError::Cancelled => RetrieverError::Cancelled,
        other => RetrieverError::Embedding(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingSettings, ProviderConfig};
    use crate::generation::ChatTurn;
    use crate::test_support::stub_server;
    use chrono::Utc;

    const SCENARIO: &str = "Sentence one is here. Sentence two follows. Sentence three ends it.";
    const RIVERS: &str = "Rivers carry water to the sea. Deltas form where rivers slow down. \
                          Floods reshape the banks every spring.";
    const MOUNTAINS: &str = "Mountains rise where plates collide. Glaciers carve deep valleys. \
                             Snow lingers on the highest peaks.";

    fn test_config(dimensions: usize) -> Config {
        Config {
            embedding: EmbeddingSettings { dimensions, fallback_on_error: true, batch_delay_ms: 0 },
            chunking: ChunkingSettings { chunk_size: 60, overlap: 10 },
            retrieval: RetrievalSettings { threshold: -1.0, ..RetrievalSettings::default() },
            ..Config::default()
        }
    }

    fn pipeline(dimensions: usize) -> RetrievalPipeline {
        let store = DocumentStore::open_in_memory().unwrap();
        RetrievalPipeline::new(&test_config(dimensions), Arc::new(store))
    }

    async fn ingest(pipeline: &RetrievalPipeline, name: &str, text: &str) -> IngestReport {
        pipeline
            .ingest_text(name, &format!("/docs/{}", name), text, &CancellationToken::new(), |_| {})
            .await
            .unwrap()
    }

    fn result(name: &str, content: &str, score: f32) -> SearchResult {
        SearchResult {
            chunk: Chunk {
                id: format!("{}_0", name),
                document_id: name.to_string(),
                index: 0,
                content: content.to_string(),
                start_index: 0,
                end_index: content.len(),
                embedding: Vec::new(),
            },
            document: DocumentInfo {
                id: name.to_string(),
                name: name.to_string(),
                path: String::new(),
                created_at: Utc::now(),
                chunk_count: 1,
            },
            score,
        }
    }

    #[tokio::test]
    async fn test_ingest_scenario() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let config = Config {
            chunking: ChunkingSettings { chunk_size: 30, overlap: 5 },
            ..test_config(16)
        };
        let pipeline = RetrievalPipeline::new(&config, store);

        let report = ingest(&pipeline, "scenario", SCENARIO).await;
        assert!((2..=3).contains(&report.chunks));
        assert_eq!(report.local_embeddings, report.chunks);

        let stored = pipeline.get(&report.document.id).await.unwrap();
        assert_eq!(stored.chunks.len(), report.chunks);
        for chunk in &stored.chunks {
            assert!(chunk.content.chars().count() <= 30);
            assert_eq!(chunk.embedding.len(), 16);
        }
    }

    #[tokio::test]
    async fn test_ingest_progress_sequence() {
        let pipeline = pipeline(8);
        let mut events = Vec::new();
        pipeline
            .ingest_text("rivers", "/docs/rivers", RIVERS, &CancellationToken::new(), |p| events.push(p))
            .await
            .unwrap();

        assert_eq!(events.first().unwrap().stage, IngestStage::Chunking);
        assert_eq!(events.last().unwrap().stage, IngestStage::Complete);

        let fractions: Vec<f32> = events.iter()
            .filter(|e| e.stage == IngestStage::Embedding)
            .filter_map(|e| e.fraction)
            .collect();
        assert_eq!(fractions.first(), Some(&0.0));
        assert_eq!(fractions.last(), Some(&1.0));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_ingest_empty_content_rejected() {
        let pipeline = pipeline(8);
        let result = pipeline
            .ingest_text("blank", "/docs/blank", "   \n", &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(RetrieverError::Validation(_))));
        assert_eq!(pipeline.stats().await.unwrap().documents, 0);
    }

    #[tokio::test]
    async fn test_ingest_noise_only_rejected() {
        let pipeline = pipeline(8);
        let result = pipeline
            .ingest_text("noise", "/docs/noise", "Hi. Ok. Yes.", &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(RetrieverError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancelled_ingest_writes_nothing() {
        let pipeline = pipeline(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.ingest_text("rivers", "/docs/rivers", RIVERS, &cancel, |_| {}).await;
        assert!(matches!(result, Err(RetrieverError::Cancelled)));
        assert_eq!(pipeline.stats().await.unwrap().chunks, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_embedding_writes_nothing() {
        let pipeline = pipeline(8);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut embedded = 0;

        let result = pipeline
            .ingest_text("rivers", "/docs/rivers", RIVERS, &cancel, |p| {
                if p.stage == IngestStage::Embedding && p.fraction.is_some_and(|f| f > 0.0) {
                    embedded += 1;
                    trigger.cancel();
                }
            })
            .await;

        assert!(matches!(result, Err(RetrieverError::Cancelled)));
        assert_eq!(embedded, 1);
        let stats = pipeline.stats().await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.chunks, 0);
    }

    #[tokio::test]
    async fn test_ingest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rivers.txt");
        std::fs::write(&path, format!("{}\x0cSecond page about estuaries and tides.", RIVERS)).unwrap();

        let pipeline = pipeline(8);
        let report = pipeline
            .ingest_file(&path, None, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(report.document.name, "rivers.txt");
        assert_eq!(report.page_count, Some(2));

        let missing = pipeline
            .ingest_file(&dir.path().join("missing.txt"), None, &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(missing, Err(RetrieverError::Extract(ExtractError::NotFound(_)))));
    }

    struct FixedExtractor;

    impl TextExtractor for FixedExtractor {
        fn extract(&self, _path: &Path) -> std::result::Result<crate::documents::extract::ExtractedText, ExtractError> {
            Ok(crate::documents::extract::ExtractedText { text: MOUNTAINS.to_string(), page_count: 4 })
        }
    }

    #[tokio::test]
    async fn test_custom_extractor() {
        let pipeline = pipeline(8).with_extractor(Arc::new(FixedExtractor));
        let report = pipeline
            .ingest_file(Path::new("/virtual/atlas.pdf"), Some("Atlas"), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(report.document.name, "Atlas");
        assert_eq!(report.document.path, "/virtual/atlas.pdf");
        assert_eq!(report.page_count, Some(4));
    }

    #[tokio::test]
    async fn test_search_finds_exact_chunk() {
        let pipeline = pipeline(32);
        ingest(&pipeline, "rivers", RIVERS).await;
        ingest(&pipeline, "mountains", MOUNTAINS).await;

        let target = pipeline.store().search_candidates().unwrap()[0].0.clone();
        let results = pipeline
            .search(&target.content, 3, -1.0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.id, target.id);
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_retrieve_uses_configured_settings() {
        let pipeline = pipeline(32);
        ingest(&pipeline, "rivers", RIVERS).await;
        ingest(&pipeline, "mountains", MOUNTAINS).await;

        let mut config = test_config(32);
        config.retrieval.top_k = 2;
        pipeline.reload(&config).unwrap();

        let cancel = CancellationToken::new();
        let retrieved = pipeline.retrieve("Glaciers carve deep valleys.", &cancel).await.unwrap();
        let searched = pipeline.search("Glaciers carve deep valleys.", 2, -1.0, &cancel).await.unwrap();
        assert_eq!(retrieved.len(), 2);
        let ids = |results: &[SearchResult]| results.iter().map(|r| r.chunk.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&retrieved), ids(&searched));

        config.retrieval.top_k = 1;
        pipeline.reload(&config).unwrap();
        let narrowed = pipeline.retrieve("Glaciers carve deep valleys.", &cancel).await.unwrap();
        assert_eq!(ids(&narrowed), ids(&searched[..1]));
    }

    #[tokio::test]
    async fn test_search_threshold_above_max_is_empty() {
        let pipeline = pipeline(16);
        ingest(&pipeline, "rivers", RIVERS).await;
        let results = pipeline.search("rivers", 5, 1.01, &CancellationToken::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_edge_inputs() {
        let pipeline = pipeline(16);
        let cancel = CancellationToken::new();
        assert!(pipeline.search("anything", 5, 0.0, &cancel).await.unwrap().is_empty());
        assert!(matches!(pipeline.search("  ", 5, 0.0, &cancel).await, Err(RetrieverError::Validation(_))));

        ingest(&pipeline, "rivers", RIVERS).await;
        assert!(pipeline.search("rivers", 0, -1.0, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_change_requires_reembed() {
        let pipeline = pipeline(16);
        let report = ingest(&pipeline, "rivers", RIVERS).await;
        pipeline.reload(&test_config(8)).unwrap();

        let cancel = CancellationToken::new();
        let result = pipeline.search("rivers", 5, -1.0, &cancel).await;
        assert!(matches!(
            result,
            Err(RetrieverError::Store(StoreError::DimensionMismatch { expected: 16, actual: 8 }))
        ));

        let mut seen = Vec::new();
        let reembedded = pipeline.reembed_all(&cancel, |c, t| seen.push((c, t))).await.unwrap();
        assert_eq!(reembedded.chunks, report.chunks);
        assert_eq!(reembedded.dimensions, 8);
        assert_eq!(seen.last(), Some(&(report.chunks, report.chunks)));
        assert_eq!(pipeline.stats().await.unwrap().dimensions, Some(8));
        assert!(!pipeline.search("rivers", 5, -1.0, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_other_document() {
        let pipeline = pipeline(8);
        let rivers = ingest(&pipeline, "rivers", RIVERS).await;
        let mountains = ingest(&pipeline, "mountains", MOUNTAINS).await;

        pipeline.delete(&rivers.document.id).await.unwrap();

        let remaining = pipeline.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].chunk_count, mountains.chunks);
        assert!(matches!(
            pipeline.get(&rivers.document.id).await,
            Err(RetrieverError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_build_context_format() {
        let results = vec![result("alpha.txt", "First excerpt.", 0.876), result("beta.txt", "Second excerpt.", 0.5)];
        let context = build_context(&results, 4000);
        assert_eq!(
            context,
            "[Source: alpha.txt | Relevance: 88%]\nFirst excerpt.\n\n---\n\n[Source: beta.txt | Relevance: 50%]\nSecond excerpt."
        );
    }

    #[test]
    fn test_build_context_respects_budget() {
        let results = vec![
            result("alpha.txt", "First excerpt with a handful of words.", 0.9),
            result("beta.txt", "Second excerpt with a handful of words.", 0.8),
        ];
        let context = build_context(&results, 1);
        assert!(context.starts_with("[Source: alpha.txt"));
        assert!(!context.contains(CONTEXT_SEPARATOR));
        assert!(build_context(&[], 100).is_empty());
    }

    #[tokio::test]
    async fn test_ask_appends_exchange_on_success() {
        let pipeline = pipeline(16);
        ingest(&pipeline, "rivers", RIVERS).await;

        let url = stub_server("200 OK", r#"{"choices":[{"message":{"content":"Deltas form where rivers slow."}}]}"#).await;
        let config = Config {
            provider: ProviderConfig {
                api_key: Some("test-key".to_string()),
                base_url: Some(url),
                timeout_secs: 5,
                ..ProviderConfig::default()
            },
            ..test_config(16)
        };
        pipeline.reload(&config).unwrap();

        let mut conversation = Conversation::new();
        let answer = pipeline
            .ask(&mut conversation, "Where do deltas form?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.text, "Deltas form where rivers slow.");
        assert!(!answer.sources.is_empty());
        assert!(answer.context.starts_with("[Source: rivers"));
        assert_eq!(conversation.turns()[0], ChatTurn::user("Where do deltas form?"));
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_ask_failure_keeps_conversation() {
        let pipeline = pipeline(16);
        ingest(&pipeline, "rivers", RIVERS).await;

        let mut conversation = Conversation::new();
        conversation.push_exchange("earlier question", "earlier answer");
        let before = conversation.clone();

        let result = pipeline.ask(&mut conversation, "Where do deltas form?", &CancellationToken::new()).await;
        assert!(matches!(result, Err(RetrieverError::Generation(GenerationError::NotConfigured(_)))));
        assert_eq!(conversation, before);

        let url = stub_server("500 Internal Server Error", "upstream down").await;
        let config = Config {
            provider: ProviderConfig {
                api_key: Some("test-key".to_string()),
                base_url: Some(url),
                timeout_secs: 5,
                ..ProviderConfig::default()
            },
            ..test_config(16)
        };
        pipeline.reload(&config).unwrap();

        let result = pipeline.ask(&mut conversation, "Where do deltas form?", &CancellationToken::new()).await;
        assert!(matches!(result, Err(RetrieverError::Generation(GenerationError::Status { status: 500, .. }))));
        assert_eq!(conversation, before);
    }

    #[test]
    fn test_error_serializes_as_message() {
        let error = RetrieverError::Validation("query is empty".to_string());
        assert_eq!(serde_json::to_string(&error).unwrap(), r#""Validation error: query is empty""#);
        assert_eq!(serde_json::to_value(RetrieverError::Cancelled).unwrap(), "Operation cancelled");
    }

    #[test]
    fn test_system_prompt_without_context() {
        assert!(system_prompt("").contains("No relevant documents were found."));
    }
}
