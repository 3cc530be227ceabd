//! Document Pipeline Module
//!
//! Chunking, embedding, similarity ranking, persistence and retrieval for
//! ingested documents.

pub mod chunker;
pub mod embeddings;
pub mod extract;
pub mod retriever;
pub mod similarity;
pub mod store;

// Re-export key public types
pub use chunker::{chunk_id, Chunk, Chunker};
pub use embeddings::{local_embedding, Embedder, Embedding, EmbeddingError, EmbeddingSource, GeneratedEmbedding};
pub use extract::{ExtractError, ExtractedText, PlainTextExtractor, TextExtractor};
pub use retriever::{
    build_context, Answer, IngestProgress, IngestReport, IngestStage, ReembedReport, RetrievalPipeline,
    RetrieverError, SearchResult,
};
pub use similarity::{cosine_similarity, top_k, Scored, SimilarityError};
pub use store::{Document, DocumentInfo, DocumentStore, StoreError, StoreStats};
