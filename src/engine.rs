//! Speech-output boundary.
//!
//! An engine speaks one utterance at a time and reports progress through
//! `SpeechEvent`s keyed by utterance id. `ConsoleSpeechEngine` "voices" text
//! word by word on stdout, which is enough to drive the fragment pipeline
//! without an audio backend.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Speech of chars `[start, end)` of the utterance text began.
    RangeStarted {
        utterance_id: String,
        start: usize,
        end: usize,
    },
    Completed { utterance_id: String, success: bool },
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Speak `text`, reporting on `events`.
    ///
    /// Implementations send exactly one `Completed` for `utterance_id`
    /// before returning.
    async fn speak(&self, utterance_id: &str, text: &str, events: &UnboundedSender<SpeechEvent>);

    /// Interrupt the utterance in progress. It completes with `success = false`.
    ///
    /// A stop that arrives between utterances applies to the next one.
    fn stop(&self);

    /// Drop a stop that no utterance has consumed yet.
    fn clear_stop(&self) {}
}

/// Char ranges of the whitespace-separated words in `text`.
pub fn word_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = None;
    let mut count = 0;

    for (i, ch) in text.chars().enumerate() {
        match (ch.is_whitespace(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                ranges.push((s, i));
                start = None;
            }
            _ => {}
        }
        count = i + 1;
    }
    if let Some(s) = start {
        ranges.push((s, count));
    }
    ranges
}

pub struct ConsoleSpeechEngine {
    word_delay: Duration,
    cancel_flag: AtomicBool,
    speak_lock: AsyncMutex<()>,
}

impl ConsoleSpeechEngine {
    pub fn new(word_delay: Duration) -> Self {
        Self {
            word_delay,
            cancel_flag: AtomicBool::new(false),
            speak_lock: AsyncMutex::new(()),
        }
    }
}

#[async_trait]
impl SpeechEngine for ConsoleSpeechEngine {
    async fn speak(&self, utterance_id: &str, text: &str, events: &UnboundedSender<SpeechEvent>) {
        let _guard = self.speak_lock.lock().await;

        let words = word_ranges(text);
        let chars: Vec<char> = text.chars().collect();
        let mut success = true;

        for (i, &(start, end)) in words.iter().enumerate() {
            if self.cancel_flag.load(Ordering::Relaxed) {
                info!("Cancelled before word {}/{}", i + 1, words.len());
                success = false;
                break;
            }

            send(
                events,
                SpeechEvent::RangeStarted {
                    utterance_id: utterance_id.to_string(),
                    start,
                    end,
                },
            );

            {
                let word: String = chars[start..end].iter().collect();
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = write!(stdout, "{word} ").and_then(|()| stdout.flush()) {
                    debug!("Failed to write word to stdout: {e}");
                }
            }

            tokio::time::sleep(self.word_delay).await;
        }

        // Consume the stop; one during the last word still interrupts.
        if self.cancel_flag.swap(false, Ordering::Relaxed) {
            success = false;
        }
        debug!("Utterance {utterance_id} done (success: {success})");

        send(
            events,
            SpeechEvent::Completed {
                utterance_id: utterance_id.to_string(),
                success,
            },
        );
    }

    fn stop(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    fn clear_stop(&self) {
        self.cancel_flag.store(false, Ordering::Relaxed);
    }
}

fn send(events: &UnboundedSender<SpeechEvent>, event: SpeechEvent) {
    if let Err(e) = events.send(event) {
        debug!("Speech event receiver gone, dropped {:?}", e.0);
    }
}
