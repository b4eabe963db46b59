use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::transcribe::{SegmentEvent, TranscriptEvent};

/// One finalized unit of transcribed speech. Immutable once created;
/// ownership moves down the pipeline by message passing.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub seq: u64,
    pub utterance_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub source_text: String,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Finalize an open utterance after this long without an ASR update.
    pub idle_final: Duration,
    /// Outbox bound toward the dispatcher; overflow drops the oldest.
    pub pending_cap: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_final: Duration::from_secs(2),
            pending_cap: 256,
        }
    }
}

#[derive(Debug)]
struct OpenUtterance {
    utterance_id: String,
    start_ms: u64,
    end_ms: u64,
    text: String,
    last_update: Instant,
}

/// Folds partial/final segment events into finalized utterances and assigns
/// each one the next sequence number. This component is the only writer of
/// the sequence counter.
///
/// At most one utterance is open at a time. It finalizes when the ASR flags
/// a final, when a discontinuity arrives, when it goes idle, or when the ASR
/// starts a different utterance while it is still open.
pub struct SegmentAggregator {
    cfg: AggregatorConfig,
    open: Option<OpenUtterance>,
    next_seq: u64,
    recent_final_ids: VecDeque<String>,
}

const RECENT_FINAL_IDS: usize = 16;

impl SegmentAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            cfg,
            open: None,
            next_seq: 1,
            recent_final_ids: VecDeque::new(),
        }
    }

    pub fn on_event(&mut self, event: SegmentEvent, now: Instant) -> Vec<Utterance> {
        let mut out = Vec::new();

        if let Some(open) = self.open.as_mut() {
            if open.utterance_id == event.utterance_id {
                open.text = event.text;
                open.start_ms = open.start_ms.min(event.start_ms);
                open.end_ms = open.end_ms.max(event.end_ms);
                open.last_update = now;
                if event.is_final {
                    out.extend(self.finalize_open());
                }
                return out;
            }

            // ASR services are expected to finalize before starting a new
            // utterance; if one shows up anyway, the open one goes final now.
            tracing::warn!(
                open = %open.utterance_id,
                incoming = %event.utterance_id,
                "new utterance started while one was open; force-finalizing"
            );
            out.extend(self.finalize_open());
        }

        if self.recently_finalized(&event.utterance_id) {
            // Duplicate delivery of a finalized event, or a stale partial
            // trailing its final. Either way the utterance already exists.
            tracing::debug!(utterance_id = %event.utterance_id, "ignoring event for finalized utterance");
            return out;
        }

        self.open = Some(OpenUtterance {
            utterance_id: event.utterance_id,
            start_ms: event.start_ms,
            end_ms: event.end_ms,
            text: event.text,
            last_update: now,
        });
        if event.is_final {
            out.extend(self.finalize_open());
        }
        out
    }

    /// Capture gap, connection loss, or ring overflow: whatever partial text
    /// exists becomes the final text.
    pub fn on_discontinuity(&mut self) -> Option<Utterance> {
        if self.open.is_some() {
            tracing::info!("discontinuity; finalizing open utterance early");
        }
        self.finalize_open()
    }

    pub fn on_idle_tick(&mut self, now: Instant) -> Option<Utterance> {
        let idle = self
            .open
            .as_ref()
            .is_some_and(|open| now.duration_since(open.last_update) >= self.cfg.idle_final);
        if idle {
            tracing::debug!("idle timeout; finalizing open utterance");
            return self.finalize_open();
        }
        None
    }

    /// Shutdown path: nothing stays open.
    pub fn force_finalize(&mut self) -> Option<Utterance> {
        self.finalize_open()
    }

    fn finalize_open(&mut self) -> Option<Utterance> {
        let open = self.open.take()?;
        self.remember_finalized(open.utterance_id.clone());
        if open.text.trim().is_empty() {
            // Nothing worth showing; no sequence number is consumed.
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Utterance {
            seq,
            utterance_id: open.utterance_id,
            start_ms: open.start_ms,
            end_ms: open.end_ms,
            source_text: open.text,
        })
    }

    fn recently_finalized(&self, utterance_id: &str) -> bool {
        self.recent_final_ids.iter().any(|id| id == utterance_id)
    }

    fn remember_finalized(&mut self, utterance_id: String) {
        self.recent_final_ids.push_back(utterance_id);
        while self.recent_final_ids.len() > RECENT_FINAL_IDS {
            self.recent_final_ids.pop_front();
        }
    }
}

pub fn spawn_aggregator(
    cfg: AggregatorConfig,
    rx: Receiver<TranscriptEvent>,
    tx: Sender<Utterance>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("aggregator".into())
        .spawn(move || run_aggregator(cfg, rx, tx))
        .expect("failed to spawn aggregator thread")
}

fn run_aggregator(cfg: AggregatorConfig, rx: Receiver<TranscriptEvent>, tx: Sender<Utterance>) {
    let pending_cap = cfg.pending_cap;
    let mut aggregator = SegmentAggregator::new(cfg);
    let mut pending: VecDeque<Utterance> = VecDeque::new();

    loop {
        flush_pending(&mut pending, &tx, pending_cap);

        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(TranscriptEvent::Segment(event)) => {
                pending.extend(aggregator.on_event(event, Instant::now()));
            }
            Ok(TranscriptEvent::Discontinuity) => {
                pending.extend(aggregator.on_discontinuity());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                pending.extend(aggregator.force_finalize());
                for utterance in pending {
                    if tx.send_timeout(utterance, Duration::from_millis(500)).is_err() {
                        tracing::warn!("dispatcher gone; dropping remaining utterances");
                        break;
                    }
                }
                return;
            }
        }

        pending.extend(aggregator.on_idle_tick(Instant::now()));
    }
}

/// Push pending utterances without ever blocking the aggregator: if the
/// dispatcher channel is full and the outbox exceeds its bound, the oldest
/// pending utterance is dropped (a documented, observable sequence gap).
fn flush_pending(pending: &mut VecDeque<Utterance>, tx: &Sender<Utterance>, cap: usize) {
    while let Some(utterance) = pending.pop_front() {
        match tx.try_send(utterance) {
            Ok(()) => {}
            Err(TrySendError::Full(utterance)) => {
                pending.push_front(utterance);
                break;
            }
            Err(TrySendError::Disconnected(_)) => {
                pending.clear();
                return;
            }
        }
    }
    while pending.len() > cap {
        if let Some(dropped) = pending.pop_front() {
            tracing::warn!(
                seq = dropped.seq,
                "utterance queue full; dropping oldest (sequence gap will be placeheld)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, start_ms: u64, end_ms: u64, text: &str, is_final: bool) -> SegmentEvent {
        SegmentEvent {
            utterance_id: id.into(),
            start_ms,
            end_ms,
            text: text.into(),
            is_final,
        }
    }

    fn aggregator() -> SegmentAggregator {
        SegmentAggregator::new(AggregatorConfig::default())
    }

    #[test]
    fn partials_revise_until_final() {
        let mut agg = aggregator();
        let now = Instant::now();

        assert!(agg.on_event(event("u1", 0, 300, "hel", false), now).is_empty());
        assert!(agg.on_event(event("u1", 0, 600, "hello", false), now).is_empty());
        let out = agg.on_event(event("u1", 0, 900, "hello world", true), now);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].source_text, "hello world");
        assert_eq!(out[0].start_ms, 0);
        assert_eq!(out[0].end_ms, 900);
    }

    #[test]
    fn seq_is_strictly_increasing_without_gaps() {
        let mut agg = aggregator();
        let now = Instant::now();

        let mut seqs = Vec::new();
        for i in 0..5 {
            let id = format!("u{i}");
            let out = agg.on_event(event(&id, i * 1000, i * 1000 + 500, "text", true), now);
            seqs.extend(out.into_iter().map(|u| u.seq));
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_final_delivery_is_idempotent() {
        let mut agg = aggregator();
        let now = Instant::now();

        let first = agg.on_event(event("u1", 0, 500, "once", true), now);
        let second = agg.on_event(event("u1", 0, 500, "once", true), now);

        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "replayed final must not produce a second utterance");
    }

    #[test]
    fn stale_partial_after_final_is_ignored() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.on_event(event("u1", 0, 500, "done", true), now);
        let out = agg.on_event(event("u1", 0, 700, "done already", false), now);
        assert!(out.is_empty());
        assert!(agg.open.is_none());
    }

    #[test]
    fn new_utterance_forces_open_one_final() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.on_event(event("u1", 0, 300, "first part", false), now);
        let out = agg.on_event(event("u2", 400, 700, "second", false), now);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].utterance_id, "u1");
        assert_eq!(out[0].source_text, "first part");
        // u2 is now the open utterance.
        let out = agg.on_event(event("u2", 400, 900, "second done", true), now);
        assert_eq!(out[0].seq, 2);
    }

    #[test]
    fn discontinuity_finalizes_with_partial_text() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.on_event(event("u1", 0, 300, "cut off mid", false), now);
        let finalized = agg.on_discontinuity().expect("open utterance should finalize");
        assert_eq!(finalized.source_text, "cut off mid");
        assert_eq!(finalized.seq, 1);
        assert!(agg.on_discontinuity().is_none());
    }

    #[test]
    fn idle_timeout_finalizes_open_utterance() {
        let mut agg = SegmentAggregator::new(AggregatorConfig {
            idle_final: Duration::from_millis(100),
            ..AggregatorConfig::default()
        });
        let start = Instant::now();

        agg.on_event(event("u1", 0, 300, "trailing off", false), start);
        assert!(agg.on_idle_tick(start + Duration::from_millis(50)).is_none());

        let finalized = agg
            .on_idle_tick(start + Duration::from_millis(150))
            .expect("idle utterance should finalize");
        assert_eq!(finalized.source_text, "trailing off");
    }

    #[test]
    fn empty_text_consumes_no_seq() {
        let mut agg = aggregator();
        let now = Instant::now();

        assert!(agg.on_event(event("u1", 0, 500, "   ", true), now).is_empty());
        let out = agg.on_event(event("u2", 600, 900, "real", true), now);
        assert_eq!(out[0].seq, 1, "blank finals must not consume sequence numbers");
    }

    #[test]
    fn flush_pending_drops_oldest_beyond_cap() {
        let (tx, rx) = crossbeam_channel::bounded::<Utterance>(1);
        let mut pending: VecDeque<Utterance> = (1..=4)
            .map(|seq| Utterance {
                seq,
                utterance_id: format!("u{seq}"),
                start_ms: 0,
                end_ms: 100,
                source_text: "x".into(),
            })
            .collect();

        // Channel takes one; cap of two forces dropping the oldest leftover.
        flush_pending(&mut pending, &tx, 2);
        assert_eq!(rx.try_recv().unwrap().seq, 1);
        let kept: Vec<u64> = pending.iter().map(|u| u.seq).collect();
        assert_eq!(kept, vec![3, 4]);
    }
}
