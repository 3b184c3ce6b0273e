//! Text embeddings for the vector fields of indexed documents.
//!
//! [`HashEmbedder`] is a deterministic FNV-1a bag-of-words embedder that needs
//! no model files. [`CachedEmbedder`] wraps any [`Embedder`] with a bounded
//! FIFO cache keyed by the SHA-256 of the input text.
//!
//! Embedding is CPU-bound and synchronous; async callers run it on the
//! blocking pool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use catalogsync_shared::{CatalogError, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Produces a fixed-length vector for a piece of text.
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// HashEmbedder
// ---------------------------------------------------------------------------

/// Deterministic, non-semantic embedder: each token hashes to one dimension.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(CatalogError::Embedding(
                "embedding dimension must be greater than zero".into(),
            ));
        }
        Ok(Self { dimension })
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0_f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 2)
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }

        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        Ok(embedding)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

// ---------------------------------------------------------------------------
// CachedEmbedder
// ---------------------------------------------------------------------------

/// Hit/miss counters for a [`CachedEmbedder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheState {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Bounded FIFO cache in front of another embedder.
///
/// The lock is held only for lookup and insert, never while embedding.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            entries: state.map.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Embedder for CachedEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = cache_key(text);
        {
            let mut state = self.lock();
            if let Some(hit) = state.map.get(&key).cloned() {
                state.hits += 1;
                return Ok(hit);
            }
            state.misses += 1;
        }

        let vector = self.inner.embed(text)?;

        let mut state = self.lock();
        if !state.map.contains_key(&key) {
            if state.order.len() >= self.capacity
                && let Some(evicted) = state.order.pop_front()
            {
                state.map.remove(&evicted);
            }
            state.order.push_back(key.clone());
            state.map.insert(key, vector.clone());
        }
        Ok(vector)
    }
}

/// SHA-256 hex digest of the text.
fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn dimension(&self) -> usize {
            4
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32; 4])
        }
    }

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(384).unwrap();
        let a = embedder.embed("Alphonso Mango").unwrap();
        let b = embedder.embed("alphonso mango").unwrap();
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(8).unwrap();
        assert_eq!(embedder.embed("").unwrap(), vec![0.0; 8]);
        assert!(HashEmbedder::new(0).is_err());
    }

    #[test]
    fn cache_hits_skip_inner() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(inner.clone(), 16);

        cached.embed("mango").unwrap();
        cached.embed("mango").unwrap();
        cached.embed("banana").unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cached.stats(),
            CacheStats {
                hits: 1,
                misses: 2,
                entries: 2
            }
        );
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(inner.clone(), 2);

        cached.embed("a1").unwrap();
        cached.embed("b22").unwrap();
        cached.embed("c333").unwrap(); // evicts "a1"
        cached.embed("b22").unwrap(); // hit
        cached.embed("a1").unwrap(); // miss again

        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cached.stats().entries, 2);
    }
}
