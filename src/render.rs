use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::app::SharedStatus;
use crate::translate::TranslatedUtterance;

/// Subtitle display surface. The built-in implementation prints to stdout;
/// GUI overlays live outside this crate.
pub trait Overlay: Send {
    fn show(&mut self, text: &str, hold_for: Duration);
    fn clear(&mut self);
}

pub struct ConsoleOverlay;

impl Overlay for ConsoleOverlay {
    fn show(&mut self, text: &str, _hold_for: Duration) {
        println!("{text}");
    }

    fn clear(&mut self) {}
}

const PLACEHOLDER_TEXT: &str = "…";
const PLACEHELD_WINDOW: usize = 64;

#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// How long to wait for a missing sequence number while later ones are
    /// ready, before a placeholder takes its slot.
    pub max_hold: Duration,
    pub hold_min: Duration,
    pub hold_max: Duration,
    pub max_queue_depth: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_hold: Duration::from_secs(3),
            hold_min: Duration::from_millis(1200),
            hold_max: Duration::from_millis(8000),
            max_queue_depth: 16,
        }
    }
}

/// One subtitle released for display, in strict sequence order.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub seq: u64,
    pub text: String,
    pub hold_for: Duration,
    pub placeholder: bool,
}

/// Reconciles out-of-order translation completions into sequence-ordered
/// releases: a waiting map keyed by seq plus a `next_expected` cursor. Only
/// uncommitted sequence numbers are ever held, so memory stays bounded by
/// the number of in-flight translations.
pub struct ReorderBuffer {
    cfg: ReorderConfig,
    waiting: BTreeMap<u64, TranslatedUtterance>,
    next_expected: u64,
    gap_since: Option<Instant>,
    placeheld: VecDeque<u64>,
}

impl ReorderBuffer {
    pub fn new(cfg: ReorderConfig) -> Self {
        Self {
            cfg,
            waiting: BTreeMap::new(),
            next_expected: 1,
            gap_since: None,
            placeheld: VecDeque::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn insert(&mut self, item: TranslatedUtterance, now: Instant) -> Vec<Release> {
        if item.seq < self.next_expected {
            if let Some(pos) = self.placeheld.iter().position(|&seq| seq == item.seq) {
                // Its slot was already filled by a placeholder; history has
                // the real text, but re-displaying would flicker.
                self.placeheld.remove(pos);
                tracing::warn!(seq = item.seq, "late arrival after placeholder; not re-displaying");
            } else {
                tracing::debug!(seq = item.seq, "duplicate arrival for released seq; ignoring");
            }
            return Vec::new();
        }
        if self.waiting.insert(item.seq, item).is_some() {
            tracing::debug!("duplicate arrival replaced identical waiting entry");
        }
        self.drain_ready(now)
    }

    /// Hold-time check; call periodically. When `next_expected` has been
    /// missing longer than `max_hold` with later entries ready, its slot (and
    /// any other missing slot up to the first ready entry) is force-filled
    /// with a placeholder so one slow translation cannot stall the rest.
    pub fn poll(&mut self, now: Instant) -> Vec<Release> {
        if self.waiting.is_empty() {
            self.gap_since = None;
            return Vec::new();
        }
        let Some(since) = self.gap_since else {
            return Vec::new();
        };
        if now.duration_since(since) < self.cfg.max_hold {
            return Vec::new();
        }

        let first_ready = *self.waiting.keys().next().expect("waiting is non-empty");
        let mut out = Vec::new();
        while self.next_expected < first_ready {
            tracing::warn!(
                seq = self.next_expected,
                "ordering timeout; emitting placeholder"
            );
            out.push(Release {
                seq: self.next_expected,
                text: PLACEHOLDER_TEXT.into(),
                hold_for: self.cfg.hold_min,
                placeholder: true,
            });
            self.placeheld.push_back(self.next_expected);
            while self.placeheld.len() > PLACEHELD_WINDOW {
                self.placeheld.pop_front();
            }
            self.next_expected += 1;
        }
        out.extend(self.drain_ready(now));
        out
    }

    /// Earliest instant at which `poll` could release something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.gap_since.map(|since| since + self.cfg.max_hold)
    }

    /// Shutdown: release everything still waiting in sequence order. Missing
    /// sequence numbers are logged as dropped rather than placeheld.
    pub fn flush(&mut self, now: Instant) -> Vec<Release> {
        let mut out = self.drain_ready(now);
        let remaining = std::mem::take(&mut self.waiting);
        for (seq, item) in remaining {
            if seq > self.next_expected {
                tracing::warn!(
                    from = self.next_expected,
                    to = seq - 1,
                    "sequence numbers never arrived; marking dropped at shutdown"
                );
            }
            out.push(release_of(&self.cfg, item));
            self.next_expected = seq + 1;
        }
        self.gap_since = None;
        out
    }

    fn drain_ready(&mut self, now: Instant) -> Vec<Release> {
        let mut out = Vec::new();
        while let Some(item) = self.waiting.remove(&self.next_expected) {
            out.push(release_of(&self.cfg, item));
            self.next_expected += 1;
        }
        if self.waiting.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_none() || !out.is_empty() {
            // A (new) gap is blocking the head of the line as of now.
            self.gap_since = Some(now);
        }
        out
    }
}

fn release_of(cfg: &ReorderConfig, item: TranslatedUtterance) -> Release {
    let duration_ms = item.end_ms.saturating_sub(item.start_ms);
    let hold_for = Duration::from_millis(duration_ms)
        .clamp(cfg.hold_min, cfg.hold_max);
    Release {
        seq: item.seq,
        text: item.target_text,
        hold_for,
        placeholder: false,
    }
}

pub fn spawn_render(
    overlay: Box<dyn Overlay>,
    cfg: ReorderConfig,
    rx: Receiver<TranslatedUtterance>,
    status: SharedStatus,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("render".into())
        .spawn(move || run_render(overlay, cfg, rx, status))
        .expect("failed to spawn render thread")
}

fn run_render(
    mut overlay: Box<dyn Overlay>,
    cfg: ReorderConfig,
    rx: Receiver<TranslatedUtterance>,
    status: SharedStatus,
) {
    let mut buffer = ReorderBuffer::new(cfg.clone());
    let mut queue: VecDeque<Release> = VecDeque::new();
    let mut hold_until: Option<Instant> = None;
    let mut was_reconnecting = false;

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(item) => {
                let now = Instant::now();
                queue.extend(buffer.insert(item, now));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                queue.extend(buffer.flush(Instant::now()));
                for release in queue.drain(..) {
                    overlay.show(&release.text, release.hold_for);
                }
                overlay.clear();
                return;
            }
        }

        let now = Instant::now();
        queue.extend(buffer.poll(now));

        while queue.len() > cfg.max_queue_depth {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    seq = dropped.seq,
                    "display queue over depth bound; dropping oldest subtitle"
                );
            }
        }

        let display_idle = hold_until.map_or(true, |until| now >= until);

        let reconnecting = status.reconnecting();
        if reconnecting && !was_reconnecting && queue.is_empty() && display_idle {
            overlay.show("[reconnecting…]", cfg.hold_min);
            hold_until = Some(now + cfg.hold_min);
        }
        was_reconnecting = reconnecting;

        if display_idle {
            if let Some(release) = queue.pop_front() {
                overlay.show(&release.text, release.hold_for);
                hold_until = Some(now + release.hold_for);
            } else if hold_until.is_some() {
                overlay.clear();
                hold_until = None;
            }
        }
    }
}
