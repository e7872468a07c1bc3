//! Builtin retrieval backend: an in-process index over the durable log.
//!
//! The index holds one immutable snapshot per namespace and is rebuilt from
//! the durable store on every maintenance cycle, so it has the same eventual
//! consistency as an external indexer. Queries read the current snapshot
//! without blocking a concurrent rebuild.

use async_trait::async_trait;
use homunculus_core::error::MemoryError;
use homunculus_core::memory::{DurableMemoryStore, MemoryRecord, RetrievalBackend, RetrievalMode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::vector::{cosine_similarity, keyword_score, reciprocal_rank_fusion, term_frequencies, tokenize};

const RRF_K: u32 = 60;

struct IndexedRecord {
    record: MemoryRecord,
    tf: HashMap<String, f32>,
}

pub struct BuiltinIndex {
    store: Arc<dyn DurableMemoryStore>,
    snapshots: RwLock<HashMap<String, Arc<Vec<IndexedRecord>>>>,
}

impl BuiltinIndex {
    pub fn new(store: Arc<dyn DurableMemoryStore>) -> Self {
        Self {
            store,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    async fn snapshot(&self, namespace: &str) -> Option<Arc<Vec<IndexedRecord>>> {
        self.snapshots.read().await.get(namespace).cloned()
    }

    fn keyword_ranking(entries: &[IndexedRecord], query: &str) -> Vec<MemoryRecord> {
        let terms = tokenize(query);
        let mut ranked: Vec<MemoryRecord> = entries
            .iter()
            .filter_map(|e| {
                let score = keyword_score(&terms, &e.record.text);
                (score > 0.0).then(|| MemoryRecord {
                    score,
                    ..e.record.clone()
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    fn cosine_ranking(entries: &[IndexedRecord], query: &str) -> Vec<MemoryRecord> {
        let query_tf = term_frequencies(query);
        let mut ranked: Vec<MemoryRecord> = entries
            .iter()
            .filter_map(|e| {
                let score = cosine_similarity(&query_tf, &e.tf);
                (score > 0.0).then(|| MemoryRecord {
                    score,
                    ..e.record.clone()
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

#[async_trait]
impl RetrievalBackend for BuiltinIndex {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn query(
        &self,
        namespace: &str,
        text: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let Some(entries) = self.snapshot(namespace).await else {
            return Ok(Vec::new());
        };

        let mut results = match mode {
            RetrievalMode::Fallback => Self::keyword_ranking(&entries, text),
            RetrievalMode::Primary => reciprocal_rank_fusion(
                &Self::keyword_ranking(&entries, text),
                &Self::cosine_ranking(&entries, text),
                RRF_K,
                top_k,
            ),
        };
        results.truncate(top_k);
        Ok(results)
    }

    async fn reindex(&self, namespace: &str) -> Result<(), MemoryError> {
        let records = self
            .store
            .read_all(namespace)
            .await
            .map_err(|e| MemoryError::IndexFailed(e.to_string()))?;
        let indexed: Vec<IndexedRecord> = records
            .into_iter()
            .map(|record| IndexedRecord {
                tf: term_frequencies(&record.text),
                record,
            })
            .collect();
        debug!(namespace, records = indexed.len(), "Builtin index rebuilt");
        self.snapshots
            .write()
            .await
            .insert(namespace.to_string(), Arc::new(indexed));
        Ok(())
    }

    async fn forget(&self, namespace: &str) {
        if self.snapshots.write().await.remove(namespace).is_some() {
            debug!(namespace, "Builtin index snapshot dropped");
        }
    }
}
