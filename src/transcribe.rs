use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::app::SharedStatus;
use crate::capture::{AudioFrame, CaptureEvent};

/// One ASR update. `utterance_id` is stable across partial revisions of the
/// same utterance; multiple partials may revise the text before a final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEvent {
    pub utterance_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AsrSessionError {
    /// The session is dead; the adapter buffers frames and reconnects.
    #[error("ASR connection lost: {0}")]
    ConnectionLost(String),
    /// Malformed or unexpected traffic; the offending item is dropped and
    /// the session keeps going.
    #[error("ASR protocol fault: {0}")]
    Protocol(String),
}

/// One bidirectional streaming session with the ASR service.
pub trait AsrSession: Send {
    fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), AsrSessionError>;

    /// Wait up to `timeout` for the next segment event. `Ok(None)` means no
    /// event is currently available.
    fn poll_event(&mut self, timeout: Duration) -> Result<Option<SegmentEvent>, AsrSessionError>;

    fn close(&mut self) {}
}

/// Opens ASR sessions; called once at startup and again on every reconnect.
pub trait AsrConnector: Send {
    fn connect(&mut self) -> anyhow::Result<Box<dyn AsrSession>>;
}

/// What the adapter hands to the segment aggregator.
#[derive(Debug)]
pub enum TranscriptEvent {
    Segment(SegmentEvent),
    /// Audio was lost (capture gap, connection loss, or ring overflow); any
    /// open utterance must be finalized early.
    Discontinuity,
}

/// Exponential reconnect backoff: base * 2^attempt, clamped to `cap`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded frame buffer used while the ASR connection is down. Capacity is a
/// latency budget in milliseconds of audio; overflow drops the oldest frames
/// and arms a discontinuity marker.
pub struct FrameRing {
    frames: VecDeque<AudioFrame>,
    buffered_ms: u64,
    capacity_ms: u64,
    overflowed: bool,
}

impl FrameRing {
    pub fn new(capacity_ms: u64) -> Self {
        Self {
            frames: VecDeque::new(),
            buffered_ms: 0,
            capacity_ms,
            overflowed: false,
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.buffered_ms += u64::from(frame.duration_ms);
        self.frames.push_back(frame);
        while self.buffered_ms > self.capacity_ms && self.frames.len() > 1 {
            if let Some(dropped) = self.frames.pop_front() {
                self.buffered_ms -= u64::from(dropped.duration_ms);
                self.overflowed = true;
            }
        }
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        let frame = self.frames.pop_front()?;
        self.buffered_ms -= u64::from(frame.duration_ms);
        Some(frame)
    }

    pub fn push_front(&mut self, frame: AudioFrame) {
        self.buffered_ms += u64::from(frame.duration_ms);
        self.frames.push_front(frame);
    }

    /// True once if any frame was dropped since the last call.
    pub fn take_overflowed(&mut self) -> bool {
        std::mem::replace(&mut self.overflowed, false)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn buffered_ms(&self) -> u64 {
        self.buffered_ms
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub ring_budget_ms: u64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Drop buffered audio at shutdown instead of flushing it through ASR.
    pub fast_stop: bool,
    /// How long after upstream drain the adapter may keep flushing.
    pub drain_deadline: Duration,
    /// Consecutive failed reconnects before giving up; `None` retries
    /// forever.
    pub connect_attempt_ceiling: Option<u32>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            ring_budget_ms: 5000,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(8),
            fast_stop: false,
            drain_deadline: Duration::from_secs(3),
            connect_attempt_ceiling: None,
        }
    }
}

pub fn spawn_adapter(
    connector: Box<dyn AsrConnector>,
    cfg: AdapterConfig,
    rx: Receiver<CaptureEvent>,
    tx: Sender<TranscriptEvent>,
    status: SharedStatus,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("asr-adapter".into())
        .spawn(move || run_adapter(connector, cfg, rx, tx, status, stop))
        .expect("failed to spawn adapter thread")
}

fn run_adapter(
    mut connector: Box<dyn AsrConnector>,
    cfg: AdapterConfig,
    rx: Receiver<CaptureEvent>,
    tx: Sender<TranscriptEvent>,
    status: SharedStatus,
    stop: Arc<AtomicBool>,
) {
    let mut ring = FrameRing::new(cfg.ring_budget_ms);
    let mut backoff = Backoff::new(cfg.backoff_base, cfg.backoff_cap);
    let mut session: Option<Box<dyn AsrSession>> = None;
    let mut next_connect_at = Instant::now();
    let mut failed_connects = 0u32;
    let mut drained = false;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if session.is_none() && Instant::now() >= next_connect_at {
            match connector.connect() {
                Ok(s) => {
                    session = Some(s);
                    backoff.reset();
                    failed_connects = 0;
                    status.set_reconnecting(false);
                    tracing::info!("ASR session connected");
                }
                Err(err) => {
                    failed_connects += 1;
                    if cfg
                        .connect_attempt_ceiling
                        .is_some_and(|ceiling| failed_connects >= ceiling)
                    {
                        tracing::error!(
                            attempts = failed_connects,
                            "ASR connection could not be re-established; stopping"
                        );
                        status.set_asr_lost(format!("{err:#}"));
                        return;
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!("ASR connect failed: {err:#}; retrying in {delay:?}");
                    status.set_reconnecting(true);
                    next_connect_at = Instant::now() + delay;
                }
            }
        }

        if !drained {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(CaptureEvent::Frame(frame)) => ring.push(frame),
                Ok(CaptureEvent::Gap) => {
                    tracing::warn!("capture gap; forcing finalization downstream");
                    if tx.send(TranscriptEvent::Discontinuity).is_err() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    drained = true;
                    drain_deadline = Some(Instant::now() + cfg.drain_deadline);
                }
            }
        }

        // Feed buffered frames into the live session.
        let mut lost: Option<String> = None;
        if let Some(sess) = session.as_mut() {
            loop {
                if ring.take_overflowed() {
                    tracing::warn!("frame ring overflowed; marking discontinuity");
                    if tx.send(TranscriptEvent::Discontinuity).is_err() {
                        return;
                    }
                }
                let Some(frame) = ring.pop() else { break };
                match sess.send_frame(&frame) {
                    Ok(()) => {}
                    Err(AsrSessionError::ConnectionLost(err)) => {
                        ring.push_front(frame);
                        lost = Some(err);
                        break;
                    }
                    Err(AsrSessionError::Protocol(err)) => {
                        tracing::warn!("ASR rejected frame: {err}");
                    }
                }
            }
        }
        if let Some(err) = lost {
            handle_disconnect(&mut session, &mut backoff, &mut next_connect_at, &status, &tx, &err);
            continue;
        }

        // Drain produced segment events.
        let mut lost: Option<String> = None;
        if let Some(sess) = session.as_mut() {
            loop {
                match sess.poll_event(Duration::from_millis(10)) {
                    Ok(Some(event)) => match validate_event(event) {
                        Ok(event) => {
                            if tx.send(TranscriptEvent::Segment(event)).is_err() {
                                return;
                            }
                        }
                        Err(msg) => tracing::warn!("malformed ASR event dropped: {msg}"),
                    },
                    Ok(None) => break,
                    Err(AsrSessionError::ConnectionLost(err)) => {
                        lost = Some(err);
                        break;
                    }
                    Err(AsrSessionError::Protocol(err)) => {
                        tracing::warn!("malformed ASR event dropped: {err}");
                    }
                }
            }
        }
        if let Some(err) = lost {
            handle_disconnect(&mut session, &mut backoff, &mut next_connect_at, &status, &tx, &err);
            continue;
        }

        if stop.load(Ordering::Relaxed) && cfg.fast_stop {
            if ring.buffered_ms() > 0 {
                tracing::info!(buffered_ms = ring.buffered_ms(), "fast stop; dropping buffered audio");
            }
            break;
        }

        if drained {
            let expired = drain_deadline.is_some_and(|d| Instant::now() >= d);
            if cfg.fast_stop || expired {
                if !ring.is_empty() {
                    tracing::warn!(buffered_ms = ring.buffered_ms(), "dropping undelivered audio at shutdown");
                }
                break;
            }
            if ring.is_empty() {
                // All audio delivered; give the session a short grace period
                // to emit its tail events before closing.
                drain_session_tail(&mut session, &tx, drain_deadline);
                break;
            }
            if session.is_none() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    if let Some(mut sess) = session.take() {
        sess.close();
    }
}

fn drain_session_tail(
    session: &mut Option<Box<dyn AsrSession>>,
    tx: &Sender<TranscriptEvent>,
    deadline: Option<Instant>,
) {
    let Some(sess) = session.as_mut() else { return };
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return;
        }
        match sess.poll_event(Duration::from_millis(50)) {
            Ok(Some(event)) => match validate_event(event) {
                Ok(event) => {
                    if tx.send(TranscriptEvent::Segment(event)).is_err() {
                        return;
                    }
                }
                Err(msg) => tracing::warn!("malformed ASR event dropped: {msg}"),
            },
            Ok(None) => return,
            Err(_) => return,
        }
    }
}

fn handle_disconnect(
    session: &mut Option<Box<dyn AsrSession>>,
    backoff: &mut Backoff,
    next_connect_at: &mut Instant,
    status: &SharedStatus,
    tx: &Sender<TranscriptEvent>,
    err: &str,
) {
    let delay = backoff.next_delay();
    tracing::warn!("ASR connection lost: {err}; reconnecting in {delay:?}");
    *session = None;
    status.set_reconnecting(true);
    let _ = tx.send(TranscriptEvent::Discontinuity);
    *next_connect_at = Instant::now() + delay;
}

fn validate_event(event: SegmentEvent) -> Result<SegmentEvent, String> {
    if event.utterance_id.is_empty() {
        return Err("empty utterance id".into());
    }
    if event.end_ms < event.start_ms {
        return Err(format!(
            "segment for {} ends ({}) before it starts ({})",
            event.utterance_id, event.end_ms, event.start_ms
        ));
    }
    Ok(event)
}
