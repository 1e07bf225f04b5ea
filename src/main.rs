//! fragment-speaker: speak text fragments through the console engine.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fragment_speaker::config::Config;
use fragment_speaker::history::UtteranceHistory;
use fragment_speaker::{ConsoleSpeechEngine, FeedbackItem, FragmentSpeaker};

#[derive(Parser, Debug)]
#[command(name = "fragment-speaker", about = "Speak text fragments with interrupt and resume")]
struct Args {
    /// Fragments of one feedback item, spoken in order
    #[arg(required_unless_present = "report")]
    fragments: Vec<String>,

    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interrupt speech after this many milliseconds, then resume
    #[arg(long)]
    interrupt_after_ms: Option<u64>,

    /// Pause between the interruption and the resume
    #[arg(long, default_value_t = 500)]
    resume_delay_ms: u64,

    /// Print the utterance report for a date (YYYY-MM-DD or "today") and exit
    #[arg(long)]
    report: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref());
    let history = UtteranceHistory::new(config.history.resolved_dir());

    if let Some(date) = &args.report {
        println!("{}", history.report(date));
        return Ok(());
    }

    let engine = Arc::new(ConsoleSpeechEngine::new(Duration::from_millis(
        config.speech.word_delay_ms,
    )));
    let mut speaker = FragmentSpeaker::new(engine, &config.speech);
    if config.history.enabled {
        info!("Recording utterances in {}", history.dir().display());
        speaker = speaker.with_history(history);
    }
    let speaker = Arc::new(speaker);

    let item = FeedbackItem::from_texts(args.fragments);
    info!("Speaking {} fragments", item.fragments().len());

    if let Some(ms) = args.interrupt_after_ms {
        let speaker = Arc::clone(&speaker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            speaker.interrupt();
        });
    }

    let mut report = speaker.speak(Arc::new(item.sequencer())).await?;
    println!();

    if let Some(resume) = report.resume.take() {
        let spoken: String = item.text().chars().take(report.resume_offset).collect();
        info!(
            "Interrupted after {} chars: '{spoken}'; resuming in {}ms",
            report.resume_offset, args.resume_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(args.resume_delay_ms)).await;

        let resumed = speaker.speak(Arc::new(resume)).await?;
        println!();
        report.utterances += resumed.utterances;
        report.failures += resumed.failures;
    }

    info!(
        "Done: {} utterances, {} failed",
        report.utterances, report.failures
    );
    Ok(())
}
