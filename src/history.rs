use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::translate::TranslatedUtterance;

/// One durable transcript/translation pair. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub source_text: String,
    pub target_text: String,
    pub logged_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_translated(item: &TranslatedUtterance) -> Self {
        Self {
            seq: item.seq,
            start_ms: item.start_ms,
            end_ms: item.end_ms,
            source_text: item.source_text.clone(),
            target_text: item.target_text.clone(),
            logged_at: Utc::now(),
        }
    }
}

/// Crash-safe append-only store for history records.
pub trait HistorySink: Send {
    fn append(&mut self, record: &HistoryRecord) -> anyhow::Result<()>;
    /// Make everything appended so far durable.
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// Line-oriented JSON log, one file per session.
pub struct JsonlHistorySink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlHistorySink {
    /// Creates `history_<timestamp>.jsonl` under `dir` for this session.
    pub fn create_session(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create history directory {}", dir.display()))?;
        let name = format!("history_{}.jsonl", Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open history log {}", path.display()))?;
        tracing::info!(path = %path.display(), "history log opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistorySink for JsonlHistorySink {
    fn append(&mut self, record: &HistoryRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(record).context("failed to encode history record")?;
        writeln!(self.writer, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Flush after this many appended records...
    pub every_records: usize,
    /// ...or after this long with records pending, whichever comes first.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_records: 1,
            interval: Duration::from_secs(2),
        }
    }
}

const APPEND_RETRIES: u32 = 3;

/// History writer loop. Persistence faults are retried with backoff and then
/// surfaced as warnings; they never stop the pipeline or touch the render
/// path, which has its own delivery channel.
pub fn spawn_history(
    sink: Box<dyn HistorySink>,
    policy: FlushPolicy,
    rx: Receiver<TranslatedUtterance>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("history".into())
        .spawn(move || run_history(sink, policy, rx))
        .expect("failed to spawn history thread")
}

fn run_history(mut sink: Box<dyn HistorySink>, policy: FlushPolicy, rx: Receiver<TranslatedUtterance>) {
    let mut unflushed = 0usize;
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(item) => {
                let record = HistoryRecord::from_translated(&item);
                if append_with_retry(sink.as_mut(), &record) {
                    unflushed += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if let Err(err) = sink.flush() {
                    tracing::warn!("final history flush failed: {err:#}");
                }
                return;
            }
        }

        let interval_due = unflushed > 0 && last_flush.elapsed() >= policy.interval;
        if unflushed >= policy.every_records.max(1) || interval_due {
            match sink.flush() {
                Ok(()) => {
                    unflushed = 0;
                    last_flush = Instant::now();
                }
                Err(err) => tracing::warn!("history flush failed: {err:#}"),
            }
        }
    }
}

fn append_with_retry(sink: &mut dyn HistorySink, record: &HistoryRecord) -> bool {
    let mut delay = Duration::from_millis(50);
    for attempt in 0..=APPEND_RETRIES {
        match sink.append(record) {
            Ok(()) => return true,
            Err(err) if attempt < APPEND_RETRIES => {
                tracing::warn!(seq = record.seq, "history append failed ({err:#}); retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => {
                tracing::warn!(seq = record.seq, "history append abandoned: {err:#}");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> HistoryRecord {
        HistoryRecord {
            seq,
            start_ms: seq * 1000,
            end_ms: seq * 1000 + 800,
            source_text: format!("source {seq}"),
            target_text: format!("target {seq}"),
            logged_at: Utc::now(),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "subtrans-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn jsonl_sink_round_trips_records() {
        let dir = temp_dir("jsonl");
        let mut sink = JsonlHistorySink::create_session(&dir).unwrap();
        sink.append(&record(1)).unwrap();
        sink.append(&record(2)).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: Vec<HistoryRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].seq, 1);
        assert_eq!(parsed[1].source_text, "source 2");

        let _ = std::fs::remove_dir_all(&dir);
    }

    struct FlakySink {
        failures_left: u32,
        appended: Vec<u64>,
    }

    impl HistorySink for FlakySink {
        fn append(&mut self, record: &HistoryRecord) -> anyhow::Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                anyhow::bail!("disk hiccup");
            }
            self.appended.push(record.seq);
            Ok(())
        }

        fn flush(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn append_retries_through_transient_faults() {
        let mut sink = FlakySink { failures_left: 2, appended: Vec::new() };
        assert!(append_with_retry(&mut sink, &record(7)));
        assert_eq!(sink.appended, vec![7]);
    }

    #[test]
    fn append_gives_up_after_retry_budget() {
        let mut sink = FlakySink { failures_left: 10, appended: Vec::new() };
        assert!(!append_with_retry(&mut sink, &record(7)));
        assert!(sink.appended.is_empty());
    }
}
