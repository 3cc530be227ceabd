//! Token counting for context budgets.
//!
//! Uses the cl100k_base encoding. Counts are memoized by content hash since the
//! same chunks are re-counted on every query that retrieves them.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

const MAX_CACHED_COUNTS: usize = 10_000;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
static COUNT_CACHE: RwLock<Option<HashMap<u64, u32>>> = RwLock::new(None);

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k_base unavailable, estimating token counts");
                None
            }
        })
        .as_ref()
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Count tokens in `text`, falling back to an estimate if the encoder can't load.
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let key = hash_content(text);
    if let Some(count) = COUNT_CACHE.read().as_ref().and_then(|c| c.get(&key).copied()) {
        return count;
    }

    let count = match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => estimate_tokens_quick(text),
    };

    let mut cache = COUNT_CACHE.write();
    let cache = cache.get_or_insert_with(HashMap::new);
    if cache.len() >= MAX_CACHED_COUNTS {
        cache.clear();
    }
    cache.insert(key, count);

    count
}

/// ~4 bytes per token
pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}
