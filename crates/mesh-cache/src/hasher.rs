//! Pooled SHA-256 hashers for cache key collapsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Mutex;

/// Length of a base64-encoded SHA-256 digest.
pub const DIGEST_LENGTH: usize = 44;

/// A small pool of reusable hashers.
///
/// Hashers are reset before they return to the pool, so any hasher taken
/// out is in its initial state.
#[derive(Debug)]
pub struct HasherPool {
    idle: Mutex<Vec<Sha256>>,
    max_idle: usize,
}

impl HasherPool {
    /// Creates a pool that keeps at most `max_idle` hashers around.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
        }
    }

    /// Returns `base64(SHA-256(input))`, always [`DIGEST_LENGTH`] characters.
    pub fn digest_base64(&self, input: &[u8]) -> String {
        let mut hasher = self.take();
        hasher.update(input);
        let digest = hasher.finalize_reset();
        self.give_back(hasher);
        STANDARD.encode(digest)
    }

    /// Number of idle hashers.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn take(&self) -> Sha256 {
        self.lock().pop().unwrap_or_default()
    }

    fn give_back(&self, hasher: Sha256) {
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(hasher);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sha256>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            tracing::error!("hasher pool lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for HasherPool {
    fn default() -> Self {
        Self::new(32)
    }
}
