//! Utterance id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces `{prefix}-{n}` ids with `n` strictly increasing from 1.
///
/// Lock-free; ids are unique across threads sharing one generator.
#[derive(Debug)]
pub struct UtteranceIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl UtteranceIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        // fetch_add returns the previous value
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.prefix)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for UtteranceIdGenerator {
    fn default() -> Self {
        Self::new("fragment")
    }
}
