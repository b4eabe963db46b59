use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use rand::Rng;
use serde::Deserialize;

use crate::aggregate::Utterance;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// Worth retrying: timeouts, connect failures, 5xx, rate limiting.
    #[error("transient translation failure: {0}")]
    Transient(String),
    /// Retrying would not help: bad request, auth, unsupported language.
    #[error("permanent translation failure: {0}")]
    Permanent(String),
}

pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError>;
}

/// Request/response JSON client for a LibreTranslate-compatible endpoint.
/// Source language is auto-detected by the service.
pub struct HttpTranslator {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpTranslator {
    pub fn new(endpoint: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("subtrans/0.1")
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { endpoint, api_key, client })
    }
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

impl Translator for HttpTranslator {
    fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        let mut body = serde_json::json!({
            "q": text,
            "source": "auto",
            "target": target_lang,
            "format": "text",
        });
        if let Some(key) = self.api_key.as_ref() {
            body["api_key"] = serde_json::Value::String(key.clone());
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| TranslateError::Transient(format!("POST {}: {err}", self.endpoint)))?;

        let status = resp.status();
        let body = resp
            .text()
            .map_err(|err| TranslateError::Transient(format!("reading response body: {err}")))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TranslateError::Transient(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(TranslateError::Permanent(format!("{status}: {body}")));
        }

        let parsed: TranslateResponse = serde_json::from_str(&body)
            .map_err(|err| TranslateError::Permanent(format!("unexpected response: {err}")))?;
        Ok(parsed.translated_text)
    }
}

/// Passes source text through unchanged; used with `--no-translate` and in
/// offline replays.
pub struct IdentityTranslator;

impl Translator for IdentityTranslator {
    fn translate(&self, text: &str, _target_lang: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }
}

/// A translated (or passthrough-fallback) utterance. `ok` is false when the
/// service could not translate; `fallback_used` marks that `target_text` is
/// the untranslated source.
#[derive(Debug, Clone)]
pub struct TranslatedUtterance {
    pub seq: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub source_text: String,
    pub target_text: String,
    pub translated_at: DateTime<Utc>,
    pub ok: bool,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent translation requests (worker threads).
    pub max_in_flight: usize,
    pub target_lang: String,
    /// Transient failures retried this many times before falling back.
    pub max_retries: u32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// With the stop flag set, skip the service and emit fallbacks so
    /// shutdown never waits on the network.
    pub fast_stop: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            target_lang: "en".into(),
            max_retries: 2,
            jitter_min_ms: 100,
            jitter_max_ms: 500,
            fast_stop: false,
        }
    }
}

/// Spawns the translation worker pool. Workers pull utterances from a shared
/// channel, so dispatch follows arrival (sequence) order with at most
/// `max_in_flight` requests outstanding and exactly one request per
/// utterance. Results go to the history channel first, then the render
/// channel: a backed-up render path can never starve the history log.
pub fn spawn_dispatcher(
    translator: Arc<dyn Translator>,
    cfg: DispatcherConfig,
    rx: Receiver<Utterance>,
    render_tx: Sender<TranslatedUtterance>,
    history_tx: Sender<TranslatedUtterance>,
    stop: Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
    (0..cfg.max_in_flight.max(1))
        .map(|worker| {
            let translator = translator.clone();
            let cfg = cfg.clone();
            let rx = rx.clone();
            let render_tx = render_tx.clone();
            let history_tx = history_tx.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("translate-{worker}"))
                .spawn(move || {
                    while let Ok(utterance) = rx.recv() {
                        let fast_quit = cfg.fast_stop && stop.load(Ordering::Relaxed);
                        let result = if fast_quit {
                            Err(TranslateError::Transient("fast stop; skipping request".into()))
                        } else {
                            translate_with_retry(translator.as_ref(), &utterance.source_text, &cfg)
                        };

                        let (target_text, ok, fallback_used) = match result {
                            Ok(text) => (text, true, false),
                            Err(err) => {
                                tracing::warn!(
                                    seq = utterance.seq,
                                    "translation failed ({err}); passing source text through"
                                );
                                (utterance.source_text.clone(), false, true)
                            }
                        };

                        let translated = TranslatedUtterance {
                            seq: utterance.seq,
                            start_ms: utterance.start_ms,
                            end_ms: utterance.end_ms,
                            source_text: utterance.source_text,
                            target_text,
                            translated_at: Utc::now(),
                            ok,
                            fallback_used,
                        };

                        let history_gone = history_tx.send(translated.clone()).is_err();
                        let render_gone = render_tx.send(translated).is_err();
                        if history_gone && render_gone {
                            break;
                        }
                    }
                })
                .expect("failed to spawn translation worker")
        })
        .collect()
}

fn translate_with_retry(
    translator: &dyn Translator,
    text: &str,
    cfg: &DispatcherConfig,
) -> Result<String, TranslateError> {
    let mut attempt = 0u32;
    loop {
        match translator.translate(text, &cfg.target_lang) {
            Ok(out) => return Ok(out),
            Err(err @ TranslateError::Permanent(_)) => return Err(err),
            Err(err @ TranslateError::Transient(_)) => {
                if attempt >= cfg.max_retries {
                    return Err(err);
                }
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(cfg.jitter_min_ms..=cfg.jitter_max_ms);
                tracing::debug!("translation attempt {attempt} failed ({err}); retrying in {jitter_ms}ms");
                std::thread::sleep(Duration::from_millis(jitter_ms));
            }
        }
    }
}
