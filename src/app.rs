use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;

use crate::aggregate::{spawn_aggregator, AggregatorConfig, Utterance};
use crate::capture::{spawn_capture_pump, CaptureEvent, FrameSource};
use crate::config::Cli;
use crate::history::{spawn_history, FlushPolicy, HistorySink, JsonlHistorySink};
use crate::render::{spawn_render, ConsoleOverlay, Overlay, ReorderConfig};
use crate::replay::{load_script, ScriptedAsrConnector, SilenceFrameSource};
use crate::transcribe::{spawn_adapter, AdapterConfig, AsrConnector, TranscriptEvent};
use crate::translate::{
    spawn_dispatcher, DispatcherConfig, HttpTranslator, IdentityTranslator, TranslatedUtterance,
    Translator,
};

/// Cross-stage status snapshot: each field has exactly one writing stage;
/// readers only ever see point-in-time copies.
#[derive(Debug, Clone)]
pub struct SharedStatus {
    inner: Arc<Mutex<StatusState>>,
}

#[derive(Debug, Default)]
struct StatusState {
    reconnecting: bool,
    capture_lost: Option<String>,
    asr_lost: Option<String>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusState::default())),
        }
    }

    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.inner.lock().reconnecting = reconnecting;
    }

    pub fn reconnecting(&self) -> bool {
        self.inner.lock().reconnecting
    }

    pub fn set_capture_lost(&self, err: String) {
        self.inner.lock().capture_lost = Some(err);
    }

    pub fn capture_lost(&self) -> Option<String> {
        self.inner.lock().capture_lost.clone()
    }

    pub fn set_asr_lost(&self, err: String) {
        self.inner.lock().asr_lost = Some(err);
    }

    pub fn asr_lost(&self) -> Option<String> {
        self.inner.lock().asr_lost.clone()
    }
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stage tuning for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub adapter: AdapterConfig,
    pub aggregator: AggregatorConfig,
    pub dispatcher: DispatcherConfig,
    pub reorder: ReorderConfig,
    pub flush: FlushPolicy,
}

impl PipelineOptions {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            adapter: AdapterConfig {
                ring_budget_ms: cli.ring_budget_ms,
                backoff_base: Duration::from_millis(cli.backoff_base_ms),
                backoff_cap: Duration::from_millis(cli.backoff_cap_ms),
                fast_stop: cli.fast_stop,
                connect_attempt_ceiling: (cli.asr_retry_ceiling > 0)
                    .then_some(cli.asr_retry_ceiling),
                ..AdapterConfig::default()
            },
            aggregator: AggregatorConfig {
                idle_final: Duration::from_millis(cli.idle_final_ms),
                ..AggregatorConfig::default()
            },
            dispatcher: DispatcherConfig {
                max_in_flight: cli.max_in_flight,
                target_lang: cli.target_language.code().into(),
                max_retries: cli.translate_retries,
                fast_stop: cli.fast_stop,
                ..DispatcherConfig::default()
            },
            reorder: ReorderConfig {
                max_hold: Duration::from_millis(cli.max_hold_ms),
                hold_min: Duration::from_millis(cli.hold_min_ms),
                hold_max: Duration::from_millis(cli.hold_max_ms),
                max_queue_depth: cli.display_queue_depth,
            },
            flush: FlushPolicy {
                every_records: cli.flush_every,
                interval: Duration::from_millis(cli.flush_interval_ms),
            },
        }
    }
}

/// Wires up and runs the whole pipeline: one thread per stage connected by
/// bounded channels, draining stage by stage once the capture feed ends.
/// Blocks until every stage has finished.
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline(
    opts: PipelineOptions,
    source: Box<dyn FrameSource>,
    connector: Box<dyn AsrConnector>,
    translator: Arc<dyn Translator>,
    overlay: Box<dyn Overlay>,
    sink: Box<dyn HistorySink>,
    status: SharedStatus,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let (capture_tx, capture_rx) = crossbeam_channel::bounded::<CaptureEvent>(256);
    let (transcript_tx, transcript_rx) = crossbeam_channel::bounded::<TranscriptEvent>(64);
    let (utterance_tx, utterance_rx) = crossbeam_channel::bounded::<Utterance>(64);
    let (render_tx, render_rx) = crossbeam_channel::bounded::<TranslatedUtterance>(64);
    let (history_tx, history_rx) = crossbeam_channel::bounded::<TranslatedUtterance>(256);

    let capture = spawn_capture_pump(source, capture_tx, status.clone(), stop.clone());
    let adapter = spawn_adapter(
        connector,
        opts.adapter,
        capture_rx,
        transcript_tx,
        status.clone(),
        stop.clone(),
    );
    let aggregator = spawn_aggregator(opts.aggregator, transcript_rx, utterance_tx);
    let workers = spawn_dispatcher(
        translator,
        opts.dispatcher,
        utterance_rx,
        render_tx,
        history_tx,
        stop.clone(),
    );
    let render = spawn_render(overlay, opts.reorder, render_rx, status.clone());
    let history = spawn_history(sink, opts.flush, history_rx);

    capture.join().map_err(|_| anyhow::anyhow!("capture thread panicked"))?;
    adapter.join().map_err(|_| anyhow::anyhow!("adapter thread panicked"))?;
    aggregator.join().map_err(|_| anyhow::anyhow!("aggregator thread panicked"))?;
    for worker in workers {
        worker.join().map_err(|_| anyhow::anyhow!("translation worker panicked"))?;
    }
    render.join().map_err(|_| anyhow::anyhow!("render thread panicked"))?;
    history.join().map_err(|_| anyhow::anyhow!("history thread panicked"))?;

    if let Some(err) = status.capture_lost() {
        anyhow::bail!("capture device lost: {err}");
    }
    if let Some(err) = status.asr_lost() {
        anyhow::bail!("ASR connection could not be re-established: {err}");
    }
    Ok(())
}

/// Binary entry point. Device and ASR service integrations live outside this
/// crate, so the bundled way to drive the pipeline end to end is a replay
/// script; translation runs against the real service unless disabled.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(script_path) = cli.replay.as_ref() else {
        anyhow::bail!(
            "no capture backend wired in; provide --replay <script.jsonl> to drive the pipeline"
        );
    };
    let entries = load_script(script_path)?;
    anyhow::ensure!(
        !entries.is_empty(),
        "replay script {} has no entries",
        script_path.display()
    );

    // Trailing second of silence lets the tail utterance finalize and drain.
    let total_ms = entries.last().map(|entry| entry.at_ms).unwrap_or(0) + 1000;
    let source = Box::new(SilenceFrameSource::new(total_ms, 20, cli.replay_speed));
    let connector = Box::new(ScriptedAsrConnector::new(entries));

    let translator: Arc<dyn Translator> = if cli.no_translate {
        Arc::new(IdentityTranslator)
    } else {
        Arc::new(HttpTranslator::new(
            cli.translate_endpoint.clone(),
            cli.translate_api_key.clone(),
        )?)
    };
    let overlay = Box::new(ConsoleOverlay);
    let sink = Box::new(JsonlHistorySink::create_session(&cli.history_dir)?);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .context("failed to set Ctrl-C handler")?;
    }

    tracing::info!(
        target_language = cli.target_language.label(),
        replay = %script_path.display(),
        "starting pipeline"
    );

    run_pipeline(
        PipelineOptions::from_cli(&cli),
        source,
        connector,
        translator,
        overlay,
        sink,
        SharedStatus::new(),
        stop,
    )
}
