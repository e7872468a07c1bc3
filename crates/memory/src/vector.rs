//! Similarity and rank-fusion utilities for the builtin index.
//!
//! Pure-Rust implementations of:
//! - Keyword overlap scoring
//! - Cosine similarity over sparse term-frequency vectors
//! - Reciprocal Rank Fusion (RRF) for merging ranked result lists

use homunculus_core::memory::MemoryRecord;
use std::collections::HashMap;

/// Lowercased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Sparse term-frequency vector.
pub fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut tf = HashMap::new();
    for term in tokenize(text) {
        *tf.entry(term).or_insert(0.0) += 1.0;
    }
    tf
}

/// Compute cosine similarity between two sparse vectors.
///
/// Returns a value in [0, 1] for non-negative inputs.
/// Returns 0.0 if either vector is empty.
pub fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| (*x as f64) * (*y as f64)))
        .sum();
    let norm_a: f64 = a.values().map(|x| (*x as f64).powi(2)).sum();
    let norm_b: f64 = b.values().map(|y| (*y as f64).powi(2)).sum();

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Fraction of distinct query terms present in `text`.
pub fn keyword_score(query_terms: &[String], text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let haystack = tokenize(text);
    let mut distinct: Vec<&String> = query_terms.iter().collect();
    distinct.sort();
    distinct.dedup();
    let hits = distinct.iter().filter(|t| haystack.contains(**t)).count();
    hits as f32 / distinct.len() as f32
}

/// Reciprocal Rank Fusion (RRF): merge two ranked result lists.
///
/// Each record's final score = sum of 1/(k + rank) across both lists.
/// The constant k controls how much weight is given to lower-ranked items.
/// Standard value is k=60.
///
/// Records are identified by (source, text). Ties keep first-seen order so the
/// fused ranking is deterministic.
pub fn reciprocal_rank_fusion(
    keyword_results: &[MemoryRecord],
    vector_results: &[MemoryRecord],
    k: u32,
    limit: usize,
) -> Vec<MemoryRecord> {
    let k = k as f32;

    let mut order: Vec<(String, String)> = Vec::new();
    let mut scores: HashMap<(String, String), (f32, MemoryRecord)> = HashMap::new();

    for list in [keyword_results, vector_results] {
        for (rank, record) in list.iter().enumerate() {
            let rrf_score = 1.0 / (k + rank as f32 + 1.0);
            let key = (record.source.clone(), record.text.clone());
            scores
                .entry(key.clone())
                .and_modify(|(score, _)| *score += rrf_score)
                .or_insert_with(|| {
                    order.push(key);
                    (rrf_score, record.clone())
                });
        }
    }

    let mut results: Vec<MemoryRecord> = order
        .into_iter()
        .filter_map(|key| scores.remove(&key))
        .map(|(score, mut record)| {
            record.score = score;
            record
        })
        .collect();

    // Stable sort keeps first-seen order among equal scores.
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}
