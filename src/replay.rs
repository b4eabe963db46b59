use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::capture::{AudioFrame, CaptureEvent, FrameSource};
use crate::transcribe::{AsrConnector, AsrSession, AsrSessionError, SegmentEvent};

/// One timed replay entry: the scripted session delivers `event` once
/// `at_ms` of audio has been fed to it, which keeps replays deterministic at
/// any pacing factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub at_ms: u64,
    #[serde(flatten)]
    pub event: SegmentEvent,
}

/// Loads a JSON-lines segment-event script. Blank lines and `#` comments are
/// skipped; entries are sorted by delivery time.
pub fn load_script(path: &Path) -> anyhow::Result<Vec<ScriptEntry>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replay script {}", path.display()))?;

    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: ScriptEntry = serde_json::from_str(line)
            .with_context(|| format!("bad script entry on line {}", idx + 1))?;
        entries.push(entry);
    }
    entries.sort_by_key(|entry| entry.at_ms);
    Ok(entries)
}

/// Emits timed silent frames; the replay harness' capture feed.
pub struct SilenceFrameSource {
    frame_ms: u32,
    total_ms: u64,
    elapsed_ms: u64,
    /// Pacing factor relative to real time; 0 disables pacing entirely.
    speed: f32,
}

impl SilenceFrameSource {
    pub fn new(total_ms: u64, frame_ms: u32, speed: f32) -> Self {
        Self {
            frame_ms: frame_ms.max(1),
            total_ms,
            elapsed_ms: 0,
            speed,
        }
    }
}

impl FrameSource for SilenceFrameSource {
    fn next_event(&mut self) -> anyhow::Result<Option<CaptureEvent>> {
        if self.elapsed_ms >= self.total_ms {
            return Ok(None);
        }
        if self.speed > 0.0 {
            std::thread::sleep(Duration::from_secs_f32(
                self.frame_ms as f32 / 1000.0 / self.speed,
            ));
        }
        let frame = AudioFrame {
            captured_at_ms: self.elapsed_ms,
            duration_ms: self.frame_ms,
            samples: vec![0.0; self.frame_ms as usize * 16],
        };
        self.elapsed_ms += u64::from(self.frame_ms);
        Ok(Some(CaptureEvent::Frame(frame)))
    }
}

/// Replays a fixed script of segment events; each `connect` starts a fresh
/// session over the same script.
pub struct ScriptedAsrConnector {
    entries: Vec<ScriptEntry>,
}

impl ScriptedAsrConnector {
    pub fn new(entries: Vec<ScriptEntry>) -> Self {
        Self { entries }
    }
}

impl AsrConnector for ScriptedAsrConnector {
    fn connect(&mut self) -> anyhow::Result<Box<dyn AsrSession>> {
        Ok(Box::new(ScriptedAsrSession {
            entries: self.entries.clone(),
            next: 0,
            fed_ms: 0,
        }))
    }
}

struct ScriptedAsrSession {
    entries: Vec<ScriptEntry>,
    next: usize,
    fed_ms: u64,
}

impl AsrSession for ScriptedAsrSession {
    fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), AsrSessionError> {
        self.fed_ms += u64::from(frame.duration_ms);
        Ok(())
    }

    fn poll_event(&mut self, _timeout: Duration) -> Result<Option<SegmentEvent>, AsrSessionError> {
        let due = self
            .entries
            .get(self.next)
            .is_some_and(|entry| entry.at_ms <= self.fed_ms);
        if due {
            let event = self.entries[self.next].event.clone();
            self.next += 1;
            return Ok(Some(event));
        }
        Ok(None)
    }
}
