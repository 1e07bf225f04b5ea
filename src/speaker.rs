//! Dispatches a feedback item's fragments to a speech engine.
//!
//! Two paths touch the sequencer concurrently: the dispatch loop pulls
//! fragments and hands them to the engine, while a router task applies
//! engine events (range started, completed) as sequencer callbacks. The loop
//! waits for the router to acknowledge each utterance before pulling again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::engine::{SpeechEngine, SpeechEvent};
use crate::fragment::{Fragment, TextFragment};
use crate::history::{Outcome, UtteranceHistory, UtteranceRecord};
use crate::sequencer::FragmentSequencer;
use crate::utterance::UtteranceIdGenerator;

pub type TextSequencer = FragmentSequencer<TextFragment>;

#[derive(Debug, Error)]
pub enum SpeakerError {
    #[error("utterance {utterance_id} failed {attempts} times in a row")]
    RetriesExhausted { utterance_id: String, attempts: u32 },
    #[error("speech events stopped before utterance {0} completed")]
    EventChannelClosed(String),
    #[error("event router task failed: {0}")]
    Router(#[from] tokio::task::JoinError),
}

/// Result of speaking one sequencer.
#[derive(Debug, Default)]
pub struct SpeakReport {
    /// Utterances dispatched, retries included.
    pub utterances: u32,
    pub failures: u32,
    pub interrupted: bool,
    /// Item offset of the interrupted fragment, 0 when none was in flight.
    pub resume_offset: usize,
    /// Independent copy of the remaining fragments after an interruption.
    pub resume: Option<TextSequencer>,
}

pub struct FragmentSpeaker {
    engine: Arc<dyn SpeechEngine>,
    ids: UtteranceIdGenerator,
    max_attempts: u32,
    interrupted: AtomicBool,
    history: Option<UtteranceHistory>,
}

impl FragmentSpeaker {
    pub fn new(engine: Arc<dyn SpeechEngine>, config: &SpeechConfig) -> Self {
        Self {
            engine,
            ids: UtteranceIdGenerator::new(config.utterance_prefix.as_str()),
            max_attempts: config.max_attempts.max(1),
            interrupted: AtomicBool::new(false),
            history: None,
        }
    }

    pub fn with_history(mut self, history: UtteranceHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Stop speaking. The running `speak` returns with a resumable report.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        self.engine.stop();
        info!("Speech interrupted");
    }

    /// Speak every fragment of `sequencer`, in order.
    ///
    /// An `interrupt` that lands while this runs, including between two
    /// utterances, stops it; one from before the call is discarded.
    pub async fn speak(&self, sequencer: Arc<TextSequencer>) -> Result<SpeakReport, SpeakerError> {
        self.interrupted.store(false, Ordering::Relaxed);
        self.engine.clear_stop();

        let (event_tx, event_rx) = mpsc::unbounded_channel::<SpeechEvent>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, bool)>();
        let router = tokio::spawn(route_events(Arc::clone(&sequencer), event_rx, done_tx));

        let result = self.dispatch(&sequencer, &event_tx, &mut done_rx).await;

        // Closing the event channel ends the router.
        drop(event_tx);
        router.await?;

        let mut report = result?;
        if report.interrupted {
            report.resume_offset = sequencer.pending_offset();
            report.resume = Some(sequencer.snapshot());
            info!("Interrupted at item offset {}", report.resume_offset);
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        sequencer: &TextSequencer,
        events: &mpsc::UnboundedSender<SpeechEvent>,
        done: &mut UnboundedReceiver<(String, bool)>,
    ) -> Result<SpeakReport, SpeakerError> {
        let mut report = SpeakReport::default();
        let mut previous: Option<Arc<TextFragment>> = None;
        let mut attempts = 0;

        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                report.interrupted = true;
                break;
            }

            let Some(fragment) = sequencer.pull() else {
                break;
            };

            if previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &fragment)) {
                attempts += 1;
            } else {
                attempts = 1;
            }
            previous = Some(Arc::clone(&fragment));

            let utterance_id = self.ids.next_id();
            let text = fragment.text();
            let item_offset = fragment.start_index_in_item();
            sequencer.set_utterance_id(utterance_id.as_str());
            debug!("Dispatching {utterance_id} (attempt {attempts}): '{text}'");

            let t0 = Instant::now();
            self.engine.speak(&utterance_id, &text, events).await;
            let success = wait_for_completion(done, &utterance_id).await?;
            report.utterances += 1;

            let interrupted = !success && self.interrupted.load(Ordering::Relaxed);
            let outcome = match (success, interrupted) {
                (true, _) => Outcome::Completed,
                (false, true) => Outcome::Interrupted,
                (false, false) => Outcome::Failed,
            };
            if let Some(history) = &self.history {
                let duration_ms = t0.elapsed().as_millis() as u64;
                history.save(&UtteranceRecord::new(
                    &utterance_id,
                    &text,
                    item_offset,
                    outcome,
                    duration_ms,
                ));
            }

            if success {
                continue;
            }
            report.failures += 1;
            if interrupted {
                report.interrupted = true;
                break;
            }

            warn!("Utterance {utterance_id} failed (attempt {attempts}/{})", self.max_attempts);
            if attempts >= self.max_attempts {
                return Err(SpeakerError::RetriesExhausted {
                    utterance_id,
                    attempts,
                });
            }
        }

        Ok(report)
    }
}

/// Apply engine events to the sequencer and acknowledge completions.
async fn route_events(
    sequencer: Arc<TextSequencer>,
    mut events: UnboundedReceiver<SpeechEvent>,
    done: mpsc::UnboundedSender<(String, bool)>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SpeechEvent::RangeStarted {
                utterance_id,
                start,
                end,
            } => sequencer.record_progress(&utterance_id, start, end),
            SpeechEvent::Completed {
                utterance_id,
                success,
            } => {
                sequencer.complete_utterance(&utterance_id, success);
                // Loop gone (error path); keep draining.
                if let Err(e) = done.send((utterance_id, success)) {
                    debug!("Completion of {} not acknowledged", e.0 .0);
                }
            }
        }
    }
}

/// Wait for the router to acknowledge `utterance_id`, skipping stale ones.
async fn wait_for_completion(
    done: &mut UnboundedReceiver<(String, bool)>,
    utterance_id: &str,
) -> Result<bool, SpeakerError> {
    while let Some((id, success)) = done.recv().await {
        if id == utterance_id {
            return Ok(success);
        }
        debug!("Skipping stale completion {id}");
    }
    Err(SpeakerError::EventChannelClosed(utterance_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{word_ranges, ConsoleSpeechEngine};
    use std::time::Duration;
    use crate::fragment::FeedbackItem;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedSender;

    /// What the scripted engine does with each utterance.
    #[derive(Clone, Copy)]
    enum Script {
        Succeed,
        Fail,
        /// Speak this many words, then behave as if stopped.
        StopAfterWords(usize),
    }

    #[derive(Default)]
    struct ScriptedEngine {
        script: Mutex<VecDeque<Script>>,
        spoken: Mutex<Vec<String>>,
        stop_hook: Mutex<Option<Arc<FragmentSpeaker>>>,
    }

    impl ScriptedEngine {
        fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Default::default()
            })
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechEngine for ScriptedEngine {
        async fn speak(&self, utterance_id: &str, text: &str, events: &UnboundedSender<SpeechEvent>) {
            self.spoken.lock().unwrap().push(text.to_string());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Succeed);
            let words = word_ranges(text);
            let spoken_words = match step {
                Script::StopAfterWords(n) => n.min(words.len()),
                _ => words.len(),
            };
            for &(start, end) in &words[..spoken_words] {
                events
                    .send(SpeechEvent::RangeStarted {
                        utterance_id: utterance_id.to_string(),
                        start,
                        end,
                    })
                    .unwrap();
            }
            if let Script::StopAfterWords(_) = step {
                let speaker = self.stop_hook.lock().unwrap().clone();
                if let Some(speaker) = speaker {
                    speaker.interrupt();
                }
            }
            events
                .send(SpeechEvent::Completed {
                    utterance_id: utterance_id.to_string(),
                    success: matches!(step, Script::Succeed),
                })
                .unwrap();
        }

        fn stop(&self) {}
    }

    fn config() -> SpeechConfig {
        SpeechConfig {
            utterance_prefix: "test".into(),
            max_attempts: 3,
            word_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn speaks_all_fragments_in_order() {
        let engine = ScriptedEngine::new([Script::Succeed; 3]);
        let speaker = FragmentSpeaker::new(engine.clone(), &config());
        let item = FeedbackItem::from_texts(["Hello", " ", "world"]);
        let sequencer = Arc::new(item.sequencer());

        let report = speaker.speak(Arc::clone(&sequencer)).await.unwrap();

        assert_eq!(engine.spoken(), vec!["Hello", " ", "world"]);
        assert_eq!(report.utterances, 3);
        assert_eq!(report.failures, 0);
        assert!(!report.interrupted);
        assert!(report.resume.is_none());
        assert!(sequencer.pull().is_none());
    }

    #[tokio::test]
    async fn failed_fragment_is_retried_from_where_it_stopped() {
        let engine = ScriptedEngine::new([Script::Fail]);
        let speaker = FragmentSpeaker::new(engine.clone(), &config());
        let item = FeedbackItem::from_texts(["one two three", " four"]);

        let report = speaker.speak(Arc::new(item.sequencer())).await.unwrap();

        // The failed attempt spoke every word, so the retry resumes at the last one.
        assert_eq!(engine.spoken(), vec!["one two three", "three", " four"]);
        assert_eq!(report.utterances, 3);
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let engine = ScriptedEngine::new([Script::Fail, Script::Fail, Script::Fail]);
        let speaker = FragmentSpeaker::new(engine.clone(), &config());
        let item = FeedbackItem::from_texts(["stuck", "never"]);

        let err = speaker.speak(Arc::new(item.sequencer())).await.unwrap_err();

        assert!(matches!(
            err,
            SpeakerError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(engine.spoken().len(), 3);
    }

    #[tokio::test]
    async fn interruption_returns_resumable_snapshot() {
        let engine = ScriptedEngine::new([Script::Succeed, Script::StopAfterWords(2)]);
        let speaker = Arc::new(FragmentSpeaker::new(engine.clone(), &config()));
        *engine.stop_hook.lock().unwrap() = Some(Arc::clone(&speaker));

        let item = FeedbackItem::from_texts(["First. ", "alpha beta gamma ", "last"]);
        let report = speaker.speak(Arc::new(item.sequencer())).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.failures, 1);
        // "First. " is 7 chars, "beta" starts 6 chars into the second fragment.
        assert_eq!(report.resume_offset, 13);
        assert_eq!(&item.text()[report.resume_offset..], "beta gamma last");

        let resume = report.resume.unwrap();
        *engine.stop_hook.lock().unwrap() = None;
        let resumed = speaker.speak(Arc::new(resume)).await.unwrap();

        assert!(!resumed.interrupted);
        assert_eq!(
            engine.spoken(),
            vec!["First. ", "alpha beta gamma ", "beta gamma ", "last"]
        );
    }

    #[tokio::test]
    async fn records_history() {
        let dir = TempDir::new().unwrap();
        let history = UtteranceHistory::new(dir.path());
        let engine = ScriptedEngine::new([Script::Fail]);
        let speaker = FragmentSpeaker::new(engine, &config()).with_history(history.clone());

        let item = FeedbackItem::from_texts(["a", "b"]);
        speaker.speak(Arc::new(item.sequencer())).await.unwrap();

        let records: Vec<UtteranceRecord> = history
            .list_dates()
            .iter()
            .flat_map(|date| history.load(date))
            .collect();
        let outcomes: Vec<Outcome> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Failed, Outcome::Completed, Outcome::Completed]
        );
        assert_eq!(records[2].item_offset, 1);
        assert_eq!(records[0].utterance_id, "test-1");
    }

    #[tokio::test]
    async fn console_engine_interrupt_yields_resumable_report() {
        let engine = Arc::new(ConsoleSpeechEngine::new(Duration::from_millis(30)));
        let speaker = Arc::new(FragmentSpeaker::new(engine, &config()));
        let item = FeedbackItem::from_texts(["one two three four five six seven", " eight"]);
        let word_starts = [0, 4, 8, 14, 19, 23, 27];

        let interrupter = {
            let speaker = Arc::clone(&speaker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(75)).await;
                speaker.interrupt();
            })
        };
        let report = speaker.speak(Arc::new(item.sequencer())).await.unwrap();
        interrupter.await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.failures, 1);
        assert!(
            word_starts.contains(&report.resume_offset) && report.resume_offset > 0,
            "resumed at {}",
            report.resume_offset
        );

        let resume = report.resume.unwrap();
        let resumed = speaker.speak(Arc::new(resume)).await.unwrap();
        assert!(!resumed.interrupted);
        assert_eq!(resumed.utterances, 2);
        assert_eq!(resumed.failures, 0);
    }

    #[tokio::test]
    async fn interrupt_before_speak_is_discarded() {
        let engine = Arc::new(ConsoleSpeechEngine::new(Duration::ZERO));
        let speaker = FragmentSpeaker::new(engine, &config());
        speaker.interrupt();

        let item = FeedbackItem::from_texts(["a b", "c"]);
        let report = speaker.speak(Arc::new(item.sequencer())).await.unwrap();

        assert!(!report.interrupted);
        assert_eq!(report.utterances, 2);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn closed_acknowledgements_report_channel_closed() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        done_tx.send(("test-1".to_string(), true)).unwrap();
        drop(done_tx);

        let err = wait_for_completion(&mut done_rx, "test-2").await.unwrap_err();
        assert!(matches!(&err, SpeakerError::EventChannelClosed(id) if id == "test-2"));
        assert_eq!(
            err.to_string(),
            "speech events stopped before utterance test-2 completed"
        );
    }

    #[tokio::test]
    async fn stale_acknowledgements_are_skipped() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        done_tx.send(("test-1".to_string(), true)).unwrap();
        done_tx.send(("test-2".to_string(), false)).unwrap();

        assert!(!wait_for_completion(&mut done_rx, "test-2").await.unwrap());
    }

    #[tokio::test]
    async fn panicked_router_maps_to_router_error() {
        let join_err = tokio::spawn(async { panic!("router died") })
            .await
            .unwrap_err();

        let err = SpeakerError::from(join_err);
        assert!(matches!(err, SpeakerError::Router(_)));
        assert!(err.to_string().starts_with("event router task failed"));
    }
}
