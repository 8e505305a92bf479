//! Lazy embedding pipeline.
//!
//! Embedding is optional: when the model cannot be loaded (offline, missing
//! binaries, no disk) the vector index is skipped and retrieval degrades to
//! lexical-only. `LazyEmbedder` has exactly three states — `Unattempted`,
//! `Ready`, `Unavailable` — and one initialization path through an
//! injectable backend factory, so tests run a deterministic backend and
//! never download models.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::store::EMBED_DIM;

/// An embedding model. Produces one vector per input text.
pub trait EmbedBackend: Send {
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String>;
}

pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn EmbedBackend>, String> + Send + Sync>;

enum EmbedState {
    Unattempted,
    Ready(Box<dyn EmbedBackend>),
    Unavailable(String),
}

pub struct LazyEmbedder {
    state: Mutex<EmbedState>,
    factory: BackendFactory,
}

impl std::fmt::Debug for LazyEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyEmbedder").finish_non_exhaustive()
    }
}

impl LazyEmbedder {
    pub fn with_factory(factory: BackendFactory) -> Self {
        Self { state: Mutex::new(EmbedState::Unattempted), factory }
    }

    /// Default production embedder: fastembed all-MiniLM-L6-v2 (384-dim).
    #[cfg(feature = "semantic")]
    pub fn fastembed() -> Self {
        Self::with_factory(Box::new(|| {
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(false);
            let model = fastembed::TextEmbedding::try_new(options)
                .map_err(|e| format!("model load failed: {e}"))?;
            Ok(Box::new(FastEmbedBackend { model }) as Box<dyn EmbedBackend>)
        }))
    }

    /// An embedder that never becomes available (semantic disabled).
    pub fn disabled(reason: &str) -> Self {
        let reason = reason.to_string();
        Self::with_factory(Box::new(move || Err(reason.clone())))
    }

    /// `Some(true)` ready, `Some(false)` failed, `None` not yet attempted.
    pub fn availability(&self) -> Option<bool> {
        match &*self.state.lock().unwrap() {
            EmbedState::Unattempted => None,
            EmbedState::Ready(_) => Some(true),
            EmbedState::Unavailable(_) => Some(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.availability() == Some(true)
    }

    /// Drop a sticky `Unavailable` so the next embed retries the load.
    /// Manual reindex calls this to backfill after connectivity returns.
    pub fn reset_for_retry(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, EmbedState::Unavailable(_)) {
            *state = EmbedState::Unattempted;
        }
    }

    /// Embed a batch. `None` means the model is unavailable — callers skip
    /// the vector index and note the degradation.
    pub fn embed_batch(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Some(Vec::new());
        }
        let mut state = self.state.lock().unwrap();
        if matches!(*state, EmbedState::Unattempted) {
            match (self.factory)() {
                Ok(backend) => {
                    info!("embedding model ready");
                    *state = EmbedState::Ready(backend);
                }
                Err(reason) => {
                    warn!(reason = reason.as_str(), "embedding model unavailable");
                    *state = EmbedState::Unavailable(reason);
                }
            }
        }
        let backend = match &mut *state {
            EmbedState::Ready(backend) => backend,
            _ => return None,
        };
        match backend.embed(texts) {
            Ok(vectors) => {
                if vectors.len() != texts.len()
                    || vectors.iter().any(|v| v.len() != EMBED_DIM)
                {
                    warn!(
                        got = vectors.len(),
                        expected = texts.len(),
                        "backend returned a malformed batch, skipping vectors"
                    );
                    return None;
                }
                Some(vectors.into_iter().map(l2_normalize).collect())
            }
            Err(e) => {
                warn!(error = e.as_str(), "embedding batch failed");
                None
            }
        }
    }

    pub fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_batch(&[text.to_string()]).and_then(|mut v| v.pop())
    }
}

/// Normalize to unit length so dot product equals cosine similarity.
fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(feature = "semantic")]
struct FastEmbedBackend {
    model: fastembed::TextEmbedding,
}

#[cfg(feature = "semantic")]
impl EmbedBackend for FastEmbedBackend {
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        self.model.embed(texts.to_vec(), None).map_err(|e| e.to_string())
    }
}

/// Deterministic test backend, shared with the integration harness.
#[doc(hidden)]
pub mod testing {
    use super::*;
    use sha2::{Digest, Sha256};

    /// Deterministic fake: token-hash bag-of-words vectors. Similar texts
    /// share tokens and therefore direction.
    pub struct HashBackend;

    impl EmbedBackend for HashBackend {
        fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Ok(texts.iter().map(|t| hash_vector(t)).collect())
        }
    }

    pub fn hash_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBED_DIM];
        let lowered = text.to_lowercase();
        for token in lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.as_bytes());
            let idx = u16::from_le_bytes([digest[0], digest[1]]) as usize % EMBED_DIM;
            v[idx] += 1.0;
        }
        v
    }

    pub fn hash_embedder() -> LazyEmbedder {
        LazyEmbedder::with_factory(Box::new(|| Ok(Box::new(HashBackend) as Box<dyn EmbedBackend>)))
    }
}
