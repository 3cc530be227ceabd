// Docent Library
// Exports the retrieval pipeline and its collaborators for the CLI binary

pub mod config;
pub mod documents;
pub mod generation;
pub mod logging;
pub mod tokens;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for CLI
pub use config::{Config, ConfigError, ProviderConfig, ProviderKind, config_path};
pub use documents::{
    build_context, Answer, Chunk, Document, DocumentInfo, DocumentStore, IngestProgress, IngestReport,
    RetrievalPipeline, RetrieverError, SearchResult, StoreStats,
};
pub use generation::{ChatRole, ChatTurn, Conversation, GenerationClient, GenerationError};
pub use logging::init_logging;
pub use tokens::{count_tokens, estimate_tokens_quick};
