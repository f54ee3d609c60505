//! Project memory store
//!
//! A flat vector index: every stored text has an embedding, search ranks by
//! cosine similarity. Data lives in three files under `memory/` (index
//! metadata, texts, vectors) and is written through on every change.
//! Embedding calls happen before the store lock is taken.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sdk::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

use crate::llm::Embedder;
use crate::persist;
use crate::state::ProjectPaths;

/// Pluggable memory contract used by agents
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, text: &str) -> EngineResult<()>;

    /// Up to `k` stored texts, most similar first, without duplicates.
    async fn search(&self, query: &str, k: usize) -> EngineResult<Vec<String>>;

    fn clear(&self) -> EngineResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct IndexMeta {
    dim: usize,
    count: usize,
}

#[derive(Debug, Default)]
struct Entries {
    dim: usize,
    texts: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

/// Brute-force cosine similarity store
pub struct VectorMemory {
    paths: ProjectPaths,
    embedder: Arc<dyn Embedder>,
    entries: Mutex<Entries>,
}

impl VectorMemory {
    pub fn open(paths: ProjectPaths, embedder: Arc<dyn Embedder>) -> EngineResult<Self> {
        let meta: Option<IndexMeta> = persist::read_json(&paths.memory_index)?;
        let texts: Vec<String> = persist::read_json(&paths.memory_texts)?.unwrap_or_default();
        let vectors: Vec<Vec<f32>> =
            persist::read_json(&paths.memory_vectors)?.unwrap_or_default();

        if texts.len() != vectors.len() {
            return Err(EngineError::CorruptState {
                path: paths.memory_dir.clone(),
                reason: format!(
                    "{} texts but {} vectors",
                    texts.len(),
                    vectors.len()
                ),
            });
        }

        let dim = meta
            .map(|m| m.dim)
            .or_else(|| vectors.first().map(Vec::len))
            .unwrap_or(0);

        Ok(Self {
            paths,
            embedder,
            entries: Mutex::new(Entries {
                dim,
                texts,
                vectors,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &Entries) -> EngineResult<()> {
        persist::write_json_atomic(&self.paths.memory_texts, &entries.texts)?;
        persist::write_json_atomic(&self.paths.memory_vectors, &entries.vectors)?;
        persist::write_json_atomic(
            &self.paths.memory_index,
            &IndexMeta {
                dim: entries.dim,
                count: entries.texts.len(),
            },
        )
    }

    /// Every stored text with its position.
    pub fn get_all(&self) -> Vec<(usize, String)> {
        self.lock().texts.iter().cloned().enumerate().collect()
    }

    /// Remove the entry at `idx`. Returns false when out of range.
    pub fn delete(&self, idx: usize) -> EngineResult<bool> {
        let mut entries = self.lock();
        if idx >= entries.texts.len() {
            return Ok(false);
        }
        entries.texts.remove(idx);
        entries.vectors.remove(idx);
        self.persist(&entries)?;
        Ok(true)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

#[async_trait]
impl MemoryStore for VectorMemory {
    async fn add(&self, text: &str) -> EngineResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let vector = self.embedder.embed(text).await?;

        let mut entries = self.lock();
        if entries.dim == 0 {
            entries.dim = vector.len();
        } else if entries.dim != vector.len() {
            return Err(EngineError::Validation(format!(
                "embedding has {} dimensions, store expects {}",
                vector.len(),
                entries.dim
            )));
        }
        entries.texts.push(text.to_string());
        entries.vectors.push(vector);
        self.persist(&entries)
    }

    async fn search(&self, query: &str, k: usize) -> EngineResult<Vec<String>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(query).await?;

        let entries = self.lock();
        let mut scored: Vec<(f32, usize)> = entries
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (cosine(&query_vec, v), i))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut results: Vec<String> = Vec::with_capacity(k);
        for (_, idx) in scored {
            let text = &entries.texts[idx];
            if !results.contains(text) {
                results.push(text.clone());
            }
            if results.len() == k {
                break;
            }
        }
        Ok(results)
    }

    fn clear(&self) -> EngineResult<()> {
        let mut entries = self.lock();
        *entries = Entries::default();
        self.persist(&entries)
    }

    fn len(&self) -> usize {
        self.lock().texts.len()
    }
}
