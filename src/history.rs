//! Utterance history and reporting.
//!
//! Stores one record per finished utterance in daily JSONL files
//! ({dir}/{YYYY-MM-DD}.jsonl).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtteranceRecord {
    pub timestamp: String,
    pub utterance_id: String,
    pub text: String,
    /// Offset of the fragment in its item when it was dispatched.
    pub item_offset: usize,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

impl UtteranceRecord {
    pub fn new(
        utterance_id: &str,
        text: &str,
        item_offset: usize,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            utterance_id: utterance_id.to_string(),
            text: text.to_string(),
            item_offset,
            outcome,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UtteranceHistory {
    dir: PathBuf,
}

impl UtteranceHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    /// Append a record to the file for the record's date.
    pub fn save(&self, record: &UtteranceRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create history dir: {e}");
            return;
        }

        // First 10 chars of the timestamp: YYYY-MM-DD
        let date = record.timestamp.get(..10).unwrap_or("unknown");
        let path = self.file(date);

        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open history file: {e}");
                return;
            }
        };

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write history record: {e}");
                } else {
                    debug!("Saved {} to {}", record.utterance_id, path.display());
                }
            }
            Err(e) => warn!("Failed to serialize history record: {e}"),
        }
    }

    /// Records for `date` (YYYY-MM-DD, or "today"). Malformed lines are skipped.
    pub fn load(&self, date: &str) -> Vec<UtteranceRecord> {
        let date = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        let contents = match fs::read_to_string(self.file(&date)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn list_dates(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        dates.sort();
        dates
    }

    pub fn report(&self, date: &str) -> String {
        let records = self.load(date);
        if records.is_empty() {
            return format!("No utterances recorded for {date}.");
        }

        let total = records.len();
        let count = |outcome: Outcome| records.iter().filter(|r| r.outcome == outcome).count();
        let completed = count(Outcome::Completed);
        let failed = count(Outcome::Failed);
        let interrupted = count(Outcome::Interrupted);
        let avg_ms = records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64;
        let chars: usize = records
            .iter()
            .filter(|r| r.outcome == Outcome::Completed)
            .map(|r| r.text.chars().count())
            .sum();

        let mut report = format!(
            "# Utterance Report for {date}\n\n\
            - Total utterances: {total}\n\
            - Completed: {completed}\n\
            - Failed: {failed}\n\
            - Interrupted: {interrupted}\n\
            - Chars spoken: {chars}\n\
            - Avg duration: {avg_ms:.0}ms\n\n\
            ## By Prefix\n"
        );

        let mut by_prefix = BTreeMap::new();
        for r in &records {
            let prefix = r
                .utterance_id
                .rsplit_once('-')
                .map_or(r.utterance_id.as_str(), |(p, _)| p);
            *by_prefix.entry(prefix).or_insert(0) += 1;
        }
        for (prefix, n) in &by_prefix {
            report.push_str(&format!("- {prefix}: {n}\n"));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, text: &str, outcome: Outcome) -> UtteranceRecord {
        let mut r = UtteranceRecord::new(id, text, 0, outcome, 100);
        r.timestamp = "2026-03-01T10:00:00.000".into();
        r
    }

    #[test]
    fn saved_records_load_back() {
        let dir = TempDir::new().unwrap();
        let history = UtteranceHistory::new(dir.path().join("nested"));

        history.save(&record("fragment-1", "Hello", Outcome::Completed));
        history.save(&record("fragment-2", "world", Outcome::Interrupted));

        let records = history.load("2026-03-01");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, Outcome::Interrupted);
        assert_eq!(history.list_dates(), vec!["2026-03-01"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let history = UtteranceHistory::new(dir.path());
        history.save(&record("fragment-1", "Hello", Outcome::Completed));
        let path = dir.path().join("2026-03-01.jsonl");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        fs::write(&path, contents).unwrap();

        assert_eq!(history.load("2026-03-01").len(), 1);
    }

    #[test]
    fn report_counts_outcomes() {
        let dir = TempDir::new().unwrap();
        let history = UtteranceHistory::new(dir.path());
        history.save(&record("fragment-1", "Hello", Outcome::Completed));
        history.save(&record("fragment-2", "there", Outcome::Failed));
        history.save(&record("fragment-3", "there", Outcome::Completed));

        let report = history.report("2026-03-01");
        assert!(report.contains("Total utterances: 3"));
        assert!(report.contains("Completed: 2"));
        assert!(report.contains("Failed: 1"));
        assert!(report.contains("Chars spoken: 10"));
        assert!(report.contains("- fragment: 3"));
    }

    #[test]
    fn empty_report() {
        let dir = TempDir::new().unwrap();
        let history = UtteranceHistory::new(dir.path());
        assert_eq!(history.report("2026-03-02"), "No utterances recorded for 2026-03-02.");
        assert!(history.list_dates().is_empty());
    }
}
