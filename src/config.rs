use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Target languages for subtitle translation, with the codes the translation
/// service expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Language {
    English,
    Spanish,
    French,
    German,
    #[value(name = "chinese", alias = "zh", alias = "zh-cn")]
    Chinese,
    #[value(name = "japanese", alias = "ja")]
    Japanese,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
            Language::French => "fr",
            Language::German => "de",
            Language::Chinese => "zh-CN",
            Language::Japanese => "ja",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Spanish => "Spanish",
            Language::French => "French",
            Language::German => "German",
            Language::Chinese => "Chinese",
            Language::Japanese => "Japanese",
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(name = "subtrans", version, about = "Live translated subtitles pipeline")]
pub struct Cli {
    /// Segment-event script (JSON lines) to replay through the pipeline.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Replay pacing factor (2.0 = twice real time, 0 = as fast as possible).
    #[arg(long, default_value_t = 1.0)]
    pub replay_speed: f32,

    /// Language subtitles are translated into.
    #[arg(long, value_enum, default_value_t = Language::English)]
    pub target_language: Language,

    /// Translation endpoint (LibreTranslate-compatible JSON API).
    #[arg(long, default_value = "https://libretranslate.com/translate")]
    pub translate_endpoint: String,

    /// Translation API key (or set `TRANSLATE_API_KEY`).
    #[arg(long, env = "TRANSLATE_API_KEY")]
    pub translate_api_key: Option<String>,

    /// Skip the translation service and pass source text through unchanged.
    #[arg(long)]
    pub no_translate: bool,

    /// Maximum concurrent translation requests.
    #[arg(long, default_value_t = 4)]
    pub max_in_flight: usize,

    /// Transient translation failures retried this many times before falling
    /// back to the untranslated source text.
    #[arg(long, default_value_t = 2)]
    pub translate_retries: u32,

    /// Finalize an open utterance after this long (ms) without an ASR update.
    #[arg(long, default_value_t = 2000)]
    pub idle_final_ms: u64,

    /// Audio (ms) buffered while the ASR connection is down; overflow drops
    /// the oldest frames and marks a discontinuity.
    #[arg(long, default_value_t = 5000)]
    pub ring_budget_ms: u64,

    /// Initial ASR reconnect backoff (ms); doubles per attempt.
    #[arg(long, default_value_t = 250)]
    pub backoff_base_ms: u64,

    /// Reconnect backoff ceiling (ms).
    #[arg(long, default_value_t = 8000)]
    pub backoff_cap_ms: u64,

    /// Consecutive failed ASR reconnects before the pipeline stops
    /// (0 = retry forever).
    #[arg(long, default_value_t = 0)]
    pub asr_retry_ceiling: u32,

    /// How long (ms) the render buffer waits for a missing sequence number
    /// before emitting a placeholder.
    #[arg(long, default_value_t = 3000)]
    pub max_hold_ms: u64,

    /// Minimum on-screen hold time (ms) per subtitle.
    #[arg(long, default_value_t = 1200)]
    pub hold_min_ms: u64,

    /// Maximum on-screen hold time (ms) per subtitle.
    #[arg(long, default_value_t = 8000)]
    pub hold_max_ms: u64,

    /// Subtitles queued for display beyond this depth drop the oldest.
    #[arg(long, default_value_t = 16)]
    pub display_queue_depth: usize,

    /// Directory for per-session history logs.
    #[arg(long, default_value = "history")]
    pub history_dir: PathBuf,

    /// Flush the history log after this many records.
    #[arg(long, default_value_t = 1)]
    pub flush_every: usize,

    /// Flush the history log at least this often (ms) while records are pending.
    #[arg(long, default_value_t = 2000)]
    pub flush_interval_ms: u64,

    /// On shutdown, drop buffered audio instead of flushing it through ASR.
    #[arg(long)]
    pub fast_stop: bool,
}
