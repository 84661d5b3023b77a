//! Deterministic token generator: unique, readable, reproducible.

use std::sync::atomic::{AtomicU64, Ordering};

use esn_schemas::TokenGenerator;

pub struct SequentialTokens {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialTokens {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl TokenGenerator for SequentialTokens {
    fn mint(&self, bytes: usize) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        // Encode the byte-width so check-in and access tokens stay visually
        // distinct in assertions.
        format!("{}-{}b-{:06}", self.prefix, bytes, n)
    }
}
