//! fragment-speaker: sequences a feedback item's fragments into a speech
//! engine, one utterance at a time, with retry on failure and resume after
//! interruption.

pub mod config;
pub mod engine;
pub mod fragment;
pub mod history;
pub mod sequencer;
pub mod speaker;
pub mod utterance;

pub use engine::{ConsoleSpeechEngine, SpeechEngine, SpeechEvent};
pub use fragment::{FeedbackItem, Fragment, TextFragment};
pub use sequencer::FragmentSequencer;
pub use speaker::{FragmentSpeaker, SpeakReport, SpeakerError};
