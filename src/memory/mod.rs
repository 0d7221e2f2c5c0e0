//! Core memory engine — compression, synthesis, planning, retrieval.
//!
//! The write path runs [`compressor`] → [`synthesizer`] → [`store`]; the read
//! path runs [`planner`] → [`retriever`] → [`answerer`]. Background
//! maintenance lives in [`consolidator`]. Type definitions live in [`types`],
//! and the three per-tenant index primitives in [`search`].

pub mod answerer;
pub mod compressor;
pub mod consolidator;
pub mod planner;
pub mod retriever;
pub mod search;
pub mod store;
pub mod synthesizer;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// sqlite-vec defaults to L2 distance. For L2-normalized vectors:
///   L2_dist = sqrt(2 * (1 - cosine_similarity))
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

/// Rough token estimate used for context budgeting (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Stopwords excluded from the lexical index.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has",
    "have", "he", "her", "his", "i", "in", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "she", "so", "that", "the", "their", "them", "they", "this", "to",
    "was", "we", "were", "will", "with", "you", "your",
];

/// Normalize text into lexical tokens: lowercase, alphanumeric word split,
/// stopword filter. Duplicates are kept — BM25 weighs term frequency.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}
