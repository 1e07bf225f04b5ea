//! Fragment content model.
//!
//! A feedback item is spoken as an ordered list of fragments. Each fragment
//! knows where its text sits inside the item and can be trimmed to resume
//! from the point where speech was interrupted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::sequencer::FragmentSequencer;

/// One unit of speakable text, shared between the sequencer and the code
/// dispatching it to a speech engine.
pub trait Fragment: Send + Sync {
    /// Current displayable text.
    fn text(&self) -> String;

    /// Record the char offset (relative to the current text) that playback
    /// has reached. Applied on the next `apply_start_index`.
    fn record_start_index(&self, start: usize);

    /// Trim the text so it begins at the recorded start offset.
    fn apply_start_index(&self);

    /// Offset of this fragment in its parent item, including a recorded
    /// start that has not been applied yet.
    fn start_index_in_item(&self) -> usize;
}

#[derive(Debug)]
struct FragmentState {
    text: String,
    start_index_in_item: usize,
    // Relative to `text`, zero when nothing is pending.
    recorded_start: usize,
}

/// Plain-text fragment. Offsets are counted in chars.
#[derive(Debug)]
pub struct TextFragment {
    state: Mutex<FragmentState>,
}

impl TextFragment {
    pub fn new(text: impl Into<String>, start_index_in_item: usize) -> Self {
        Self {
            state: Mutex::new(FragmentState {
                text: text.into(),
                start_index_in_item,
                recorded_start: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FragmentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Fragment for TextFragment {
    fn text(&self) -> String {
        self.state().text.clone()
    }

    fn record_start_index(&self, start: usize) {
        let mut state = self.state();
        let len = state.text.chars().count();
        state.recorded_start = start.min(len);
    }

    fn apply_start_index(&self) {
        let mut state = self.state();
        let start = state.recorded_start;
        if start == 0 {
            return;
        }

        let byte_start = state
            .text
            .char_indices()
            .nth(start)
            .map_or(state.text.len(), |(i, _)| i);
        state.text = state.text[byte_start..].to_string();
        state.start_index_in_item += start;
        state.recorded_start = 0;
        debug!(
            "Fragment resumed at item offset {}: '{}'",
            state.start_index_in_item, state.text
        );
    }

    fn start_index_in_item(&self) -> usize {
        let state = self.state();
        state.start_index_in_item + state.recorded_start
    }
}

/// An item of feedback, already split into fragments.
#[derive(Debug, Clone, Default)]
pub struct FeedbackItem {
    fragments: Vec<Arc<TextFragment>>,
}

impl FeedbackItem {
    /// Build an item from fragment texts, assigning each fragment its char
    /// offset within the concatenated item text.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut offset = 0;
        let fragments = texts
            .into_iter()
            .map(|text| {
                let text = text.into();
                let fragment = Arc::new(TextFragment::new(text.as_str(), offset));
                offset += text.chars().count();
                fragment
            })
            .collect();
        Self { fragments }
    }

    pub fn fragments(&self) -> &[Arc<TextFragment>] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Full item text (the current text of every fragment, concatenated).
    pub fn text(&self) -> String {
        self.fragments.iter().map(|f| f.text()).collect()
    }

    pub fn sequencer(&self) -> FragmentSequencer<TextFragment> {
        FragmentSequencer::new(self.fragments.clone())
    }
}
