use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::Sender;

use crate::app::SharedStatus;

/// One fixed-duration chunk of mono audio with a monotonic capture timestamp.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub captured_at_ms: u64,
    pub duration_ms: u32,
    pub samples: Vec<f32>,
}

/// Output of the capture feed. A stalled device must yield `Gap` instead of
/// silently dropping audio; downstream treats a gap as a forced finalization
/// boundary for any in-flight utterance.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    Gap,
}

/// A live audio feed. Implementations wrap the actual capture device; the
/// pipeline only sees timestamped frames and gap markers.
pub trait FrameSource: Send {
    /// Blocking pull for the next capture event. `Ok(None)` ends the feed.
    fn next_event(&mut self) -> anyhow::Result<Option<CaptureEvent>>;
}

/// Pumps a frame source into the capture channel until the feed ends, the
/// stop flag is set, or the device faults.
///
/// Frames with a timestamp older than the previous frame violate the source
/// contract and are dropped. A device fault ends the feed after signalling a
/// gap, so the rest of the pipeline finalizes and drains normally; the fault
/// itself is surfaced through `status`.
pub fn spawn_capture_pump(
    mut source: Box<dyn FrameSource>,
    tx: Sender<CaptureEvent>,
    status: SharedStatus,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            let mut last_at_ms = 0u64;
            while !stop.load(Ordering::Relaxed) {
                match source.next_event() {
                    Ok(Some(event)) => {
                        if let CaptureEvent::Frame(frame) = &event {
                            if frame.captured_at_ms < last_at_ms {
                                tracing::warn!(
                                    captured_at_ms = frame.captured_at_ms,
                                    last_at_ms,
                                    "dropping frame with non-monotonic timestamp"
                                );
                                continue;
                            }
                            last_at_ms = frame.captured_at_ms;
                        }
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!("capture device fault: {err:#}");
                        status.set_capture_lost(format!("{err:#}"));
                        let _ = tx.send(CaptureEvent::Gap);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SharedStatus;

    struct ScriptedSource {
        events: Vec<anyhow::Result<Option<CaptureEvent>>>,
    }

    impl FrameSource for ScriptedSource {
        fn next_event(&mut self) -> anyhow::Result<Option<CaptureEvent>> {
            if self.events.is_empty() {
                return Ok(None);
            }
            self.events.remove(0)
        }
    }

    fn frame(at_ms: u64) -> CaptureEvent {
        CaptureEvent::Frame(AudioFrame {
            captured_at_ms: at_ms,
            duration_ms: 20,
            samples: vec![0.0; 320],
        })
    }

    #[test]
    fn pump_forwards_events_in_order() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let source = ScriptedSource {
            events: vec![Ok(Some(frame(0))), Ok(Some(CaptureEvent::Gap)), Ok(Some(frame(20)))],
        };
        let handle = spawn_capture_pump(
            Box::new(source),
            tx,
            SharedStatus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        handle.join().unwrap();

        let collected: Vec<CaptureEvent> = rx.iter().collect();
        assert_eq!(collected.len(), 3);
        assert!(matches!(collected[1], CaptureEvent::Gap));
    }

    #[test]
    fn pump_drops_non_monotonic_frames() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let source = ScriptedSource {
            events: vec![Ok(Some(frame(100))), Ok(Some(frame(40))), Ok(Some(frame(120)))],
        };
        spawn_capture_pump(
            Box::new(source),
            tx,
            SharedStatus::new(),
            Arc::new(AtomicBool::new(false)),
        )
        .join()
        .unwrap();

        let stamps: Vec<u64> = rx
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Frame(f) => Some(f.captured_at_ms),
                CaptureEvent::Gap => None,
            })
            .collect();
        assert_eq!(stamps, vec![100, 120]);
    }

    #[test]
    fn device_fault_signals_gap_and_status() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let status = SharedStatus::new();
        let source = ScriptedSource {
            events: vec![Ok(Some(frame(0))), Err(anyhow::anyhow!("device unplugged"))],
        };
        spawn_capture_pump(
            Box::new(source),
            tx,
            status.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .join()
        .unwrap();

        let collected: Vec<CaptureEvent> = rx.iter().collect();
        assert!(matches!(collected.last(), Some(CaptureEvent::Gap)));
        assert!(status.capture_lost().is_some());
    }
}
