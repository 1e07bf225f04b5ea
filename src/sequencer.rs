//! Fragment sequencer: hands out one fragment at a time to the speech path.
//!
//! The sequencer keeps at most one fragment "in flight". Pulls re-expose it
//! until a matching successful completion clears it, so a failed or
//! interrupted utterance is re-delivered (trimmed to where it stopped).
//!
//! State of `current`:
//! EMPTY → PENDING (pull advanced) → PENDING (re-pulled, 0..n) → EMPTY (success)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, trace, warn};

use crate::fragment::Fragment;

type Source<F> = Box<dyn Iterator<Item = Arc<F>> + Send>;

pub struct FragmentSequencer<F: Fragment + 'static> {
    source: Mutex<Source<F>>,
    // Shared with the engine callback path.
    current: Mutex<Option<Arc<F>>>,
    utterance_id: RwLock<Option<String>>,
}

impl<F: Fragment + 'static> FragmentSequencer<F> {
    pub fn new<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = Arc<F>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Mutex::new(Box::new(fragments.into_iter())),
            current: Mutex::new(None),
            utterance_id: RwLock::new(None),
        }
    }

    /// Return the fragment due for output, or `None` when the sequence is
    /// exhausted and nothing is in flight.
    ///
    /// A pending fragment is returned again (same `Arc`) after applying any
    /// start offset recorded since it was last pulled.
    pub fn pull(&self) -> Option<Arc<F>> {
        let mut current = lock(&self.current);
        let fragment = match current.as_ref() {
            Some(pending) => {
                pending.apply_start_index();
                Arc::clone(pending)
            }
            None => {
                let next = lock(&self.source).next()?;
                *current = Some(Arc::clone(&next));
                next
            }
        };
        trace!("pull -> '{}'", fragment.text());
        Some(fragment)
    }

    /// Associate `id` with the fragment in flight. Call before dispatching it.
    pub fn set_utterance_id(&self, id: impl Into<String>) {
        *self
            .utterance_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(id.into());
    }

    pub fn utterance_id(&self) -> Option<String> {
        self.utterance_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current(&self) -> Option<Arc<F>> {
        lock(&self.current).clone()
    }

    /// Engine callback: speech of `[start, end)` within the current fragment began.
    pub fn record_progress(&self, utterance_id: &str, start: usize, end: usize) {
        if !self.matches(utterance_id) {
            debug!(
                "Range started for different utterance, expected: {:?}, actual: {utterance_id}",
                self.utterance_id()
            );
            return;
        }

        let current = lock(&self.current);
        match current.as_ref() {
            Some(fragment) => {
                fragment.record_start_index(start);
                trace!(
                    "Speaking '{}'",
                    char_range(&fragment.text(), start, end)
                );
            }
            None => debug!("Range started for {utterance_id} with nothing in flight"),
        }
    }

    /// Offset of the in-flight fragment within its item, or 0 when idle.
    pub fn pending_offset(&self) -> usize {
        lock(&self.current)
            .as_ref()
            .map_or(0, |fragment| fragment.start_index_in_item())
    }

    /// Engine callback: the utterance finished. Only a matching successful
    /// completion releases the in-flight fragment; a failure keeps it so the
    /// next pull re-delivers it.
    ///
    /// An utterance that never completes leaves its fragment pending.
    pub fn complete_utterance(&self, utterance_id: &str, success: bool) {
        if !self.matches(utterance_id) {
            warn!(
                "Completion for {utterance_id} ignored, in flight: {:?}",
                self.utterance_id()
            );
            return;
        }

        if success {
            lock(&self.current).take();
        } else {
            debug!("Utterance {utterance_id} failed, fragment kept for retry");
        }
    }

    /// Fork this sequencer.
    ///
    /// The not-yet-pulled fragments are collected once; the returned sequencer
    /// and `self` each continue over their own copy of that list, sharing the
    /// same in-flight fragment and utterance id at the moment of the call.
    pub fn snapshot(&self) -> Self {
        let mut source = lock(&self.source);
        let remaining: Vec<Arc<F>> = source.by_ref().collect();
        *source = Box::new(remaining.clone().into_iter());
        drop(source);

        debug!("Snapshot with {} remaining fragments", remaining.len());
        Self {
            source: Mutex::new(Box::new(remaining.into_iter())),
            current: Mutex::new(self.current()),
            utterance_id: RwLock::new(self.utterance_id()),
        }
    }

    fn matches(&self, utterance_id: &str) -> bool {
        self.utterance_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(utterance_id)
    }
}

impl<F: Fragment + 'static> std::fmt::Debug for FragmentSequencer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentSequencer")
            .field(
                "current",
                &lock(&self.current).as_ref().map(|fragment| fragment.text()),
            )
            .field(
                "utterance_id",
                &*self.utterance_id.read().unwrap_or_else(PoisonError::into_inner),
            )
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Substring by char offsets, clamped to the text.
fn char_range(text: &str, start: usize, end: usize) -> &str {
    let byte_at = |n: usize| text.char_indices().nth(n).map_or(text.len(), |(i, _)| i);
    let start = byte_at(start);
    let end = byte_at(end).max(start);
    &text[start..end]
}
