//! Document Chunking
//!
//! Splits extracted text into overlapping, sentence-aligned chunks for
//! embedding and retrieval. Sentences are never cut: a sentence longer than
//! the target size becomes a chunk of its own.

use serde::{Deserialize, Serialize};

use crate::config::ChunkingSettings;

/// Sentence fragments at or below this many characters are treated as noise
const MIN_SENTENCE_CHARS: usize = 10;

/// A chunk of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// `<document_id>_<index>`
    pub id: String,
    /// Owning document (reference only)
    pub document_id: String,
    /// Position within the document's chunk sequence
    pub index: u32,
    pub content: String,
    /// Approximate start position in the original text (chars)
    pub start_index: usize,
    /// Approximate end position in the original text (chars)
    pub end_index: usize,
    /// Empty until embedded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// Build a chunk ID from its document and sequence index
pub fn chunk_id(document_id: &str, index: u32) -> String {
    format!("{}_{}", document_id, index)
}

/// A candidate sentence with its char span in the original text
#[derive(Debug, Clone, PartialEq)]
struct Sentence {
    text: String,
    start: usize,
    end: usize,
}

/// Sentence-aligned chunker
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self { chunk_size, overlap }
    }

    pub fn from_settings(settings: &ChunkingSettings) -> Self {
        Self::new(settings.chunk_size, settings.overlap)
    }

    /// Split `text` into chunks owned by `document_id`
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let sentences = split_sentences(text);
        let mut chunks = Vec::new();

        let mut buffer = String::new();
        let mut buffer_chars = 0usize;
        let mut buffer_start = 0usize;
        let mut buffer_end = 0usize;

        for sentence in sentences {
            let sentence_chars = sentence.text.chars().count();

            if buffer_chars == 0 {
                buffer.push_str(&sentence.text);
                buffer_chars = sentence_chars;
                buffer_start = sentence.start;
                buffer_end = sentence.end;
                continue;
            }

            if buffer_chars + 1 + sentence_chars <= self.chunk_size {
                buffer.push(' ');
                buffer.push_str(&sentence.text);
                buffer_chars += 1 + sentence_chars;
                buffer_end = sentence.end;
                continue;
            }

            // Close the current chunk and seed the next one
            let closed = std::mem::take(&mut buffer);
            let tail = self.overlap_tail(&closed, buffer_chars, sentence_chars);
            self.push_chunk(&mut chunks, document_id, closed, buffer_start, buffer_end);

            match tail {
                Some(tail) => {
                    let tail_chars = tail.chars().count();
                    buffer_start = buffer_end.saturating_sub(tail_chars);
                    buffer = tail;
                    buffer.push(' ');
                    buffer.push_str(&sentence.text);
                    buffer_chars = tail_chars + 1 + sentence_chars;
                }
                None => {
                    buffer.push_str(&sentence.text);
                    buffer_chars = sentence_chars;
                    buffer_start = sentence.start;
                }
            }
            buffer_end = sentence.end;
        }

        if !buffer.is_empty() {
            self.push_chunk(&mut chunks, document_id, buffer, buffer_start, buffer_end);
        }

        chunks
    }

    /// Last `overlap` chars of a closed chunk, if they fit alongside the next sentence
    fn overlap_tail(&self, closed: &str, closed_chars: usize, next_chars: usize) -> Option<String> {
        if self.overlap == 0 || closed_chars <= self.overlap {
            return None;
        }
        // Seeding must not push the next chunk past chunk_size; drop the overlap instead
        if self.overlap + 1 + next_chars > self.chunk_size {
            return None;
        }
        Some(closed.chars().skip(closed_chars - self.overlap).collect())
    }

    fn push_chunk(&self, chunks: &mut Vec<Chunk>, document_id: &str, content: String, start: usize, end: usize) {
        let index = chunks.len() as u32;
        chunks.push(Chunk {
            id: chunk_id(document_id, index),
            document_id: document_id.to_string(),
            index,
            content,
            start_index: start,
            end_index: end,
            embedding: Vec::new(),
        });
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_settings(&ChunkingSettings::default())
    }
}

/// Split on runs of `.`, `!` or `?` followed by whitespace or end of text
fn split_sentences(text: &str) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut start_byte = 0usize;
    let mut start_char = 0usize;
    let mut char_pos = 0usize;

    while let Some((byte_idx, ch)) = chars.next() {
        char_pos += 1;
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = match chars.peek() {
            None => true,
            Some((_, next)) => next.is_whitespace(),
        };
        if at_boundary {
            let end_byte = byte_idx + ch.len_utf8();
            push_sentence(&mut sentences, &text[start_byte..end_byte], start_char);
            start_byte = end_byte;
            start_char = char_pos;
        }
    }

    if start_byte < text.len() {
        push_sentence(&mut sentences, &text[start_byte..], start_char);
    }

    sentences
}

fn push_sentence(sentences: &mut Vec<Sentence>, raw: &str, raw_start: usize) {
    let leading = raw.chars().take_while(|c| c.is_whitespace()).count();
    let trimmed = raw.trim();
    let span = trimmed.chars().count();
    let text = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.chars().count() <= MIN_SENTENCE_CHARS {
        return;
    }

    sentences.push(Sentence {
        text,
        start: raw_start + leading,
        end: raw_start + leading + span,
    });
}
