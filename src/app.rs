//! Core application runner for `attendance-scanner`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with an injected advertisement source
//! and an injected HTTP transport.

use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::event_log::{EventLog, EventLogConfig, LogRecord};
use crate::pipeline::{Origin, Pipeline, PipelineConfig};
use crate::queue::{MAX_QUEUE_CAPACITY, QueueConsumer, handoff_queue};
use crate::scanner::{Advertisement, AdvertisementSource, ScanError};
use crate::throttle::ThrottleStore;
use crate::verify::http::HttpTransport;
use crate::verify::{
    CredentialError, RetryPolicy, Transport, VerificationClient, VerificationOutcome,
    VerifierConfig,
};
use clap::Parser;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Smallest size threshold accepted for event log rotation.
pub const MIN_LOG_MAX_BYTES: u64 = 100_000;

/// Delay before the first device cache poll, so the scanner can start.
const POLL_START_DELAY: Duration = Duration::from_millis(250);

/// Configuration for the scanner.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Base URL of the verification service (https only)
    #[arg(long, env = "ATTENDANCE_BASE_URL")]
    pub base_url: String,

    /// Gym this scanner is installed at
    #[arg(long, env = "ATTENDANCE_GYM_ID")]
    pub gym_id: u64,

    /// Shared secret sent with every request (64 hex characters)
    #[arg(long, env = "ATTENDANCE_SCANNER_KEY", hide_env_values = true)]
    pub scanner_key: String,

    /// Identifier of this scanner as registered with the verifier
    #[arg(long, env = "ATTENDANCE_SCANNER_ID", default_value = "laptop-1")]
    pub scanner_id: String,

    /// Ignore sightings weaker than this, in dBm
    #[arg(long, env = "ATTENDANCE_MIN_RSSI", default_value_t = crate::throttle::DEFAULT_MIN_RSSI, allow_negative_numbers = true)]
    pub min_rssi: i16,

    /// Only decode manufacturer data of `--vendor-id`
    #[arg(long, env = "ATTENDANCE_STRICT_VENDOR")]
    pub strict_vendor: bool,

    /// Company id used by `--strict-vendor`. Accepts decimal or 0x-prefixed hex.
    #[arg(long, env = "ATTENDANCE_VENDOR_ID", value_parser = parse_company_id, default_value = "0x004C")]
    pub vendor_id: u16,

    /// Timeout of a single HTTP attempt.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, env = "ATTENDANCE_HTTP_TIMEOUT", value_parser = crate::throttle::parse_duration, default_value = "12s")]
    pub http_timeout: Duration,

    /// Attempts per HTTP request, including the first one
    #[arg(long, env = "ATTENDANCE_HTTP_RETRIES", default_value_t = crate::verify::DEFAULT_HTTP_RETRIES)]
    pub http_retries: u32,

    /// Backoff before the first retry; doubles on every further retry
    #[arg(long, env = "ATTENDANCE_RETRY_BASE_DELAY", value_parser = crate::throttle::parse_duration, default_value = "600ms")]
    pub retry_base_delay: Duration,

    /// Frames waiting for verification before new ones are dropped
    #[arg(long, env = "ATTENDANCE_QUEUE_CAPACITY", default_value_t = crate::queue::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Forward each (user, token) at most once per window
    #[arg(long, env = "ATTENDANCE_THROTTLE_WINDOW", value_parser = crate::throttle::parse_duration, default_value = "25s")]
    pub throttle_window: Duration,

    /// Number of concurrent verification workers
    #[arg(long, env = "ATTENDANCE_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Interval between device cache polls
    #[arg(long, env = "ATTENDANCE_POLL_INTERVAL", value_parser = crate::throttle::parse_duration, default_value = "750ms")]
    pub poll_interval: Duration,

    /// Scan this long before the first device cache check at startup.
    /// Finding no devices only warns; a failing cache read aborts startup.
    #[arg(long, env = "ATTENDANCE_PREFLIGHT", value_parser = crate::throttle::parse_duration, default_value = "1200ms")]
    pub preflight: Duration,

    /// Log a status line with the scanner counters at this interval
    #[arg(long, env = "ATTENDANCE_STATUS_INTERVAL", value_parser = crate::throttle::parse_duration)]
    pub status_interval: Option<Duration>,

    /// JSON-lines event log [default: <data dir>/logs/scanner_gym<ID>_<SCANNER>.jsonl]
    #[arg(long, env = "ATTENDANCE_SCANNER_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Rotate the event log once it reaches this size (at least 100000)
    #[arg(long, env = "ATTENDANCE_SCANNER_LOG_MAX_BYTES", default_value_t = crate::event_log::DEFAULT_LOG_MAX_BYTES)]
    pub log_max_bytes: u64,

    /// Rotated event log files to keep; 0 disables rotation
    #[arg(long, env = "ATTENDANCE_SCANNER_LOG_BACKUPS", default_value_t = crate::event_log::DEFAULT_LOG_BACKUPS)]
    pub log_backups: usize,

    /// Path of the verify endpoint, relative to the base URL
    #[arg(long, default_value = "verify")]
    pub verify_path: String,

    /// Path of the credential validation endpoint, relative to the base URL
    #[arg(long, default_value = "validate")]
    pub validate_path: String,

    /// Bluetooth adapter to scan with, such as hci0
    #[arg(long, env = "ATTENDANCE_BLE_ADAPTER")]
    pub adapter: Option<String>,

    /// Log the key hint returned by the credential check
    #[arg(long, env = "ATTENDANCE_SHOW_KEY_HINT")]
    pub show_key_hint: bool,

    /// Verbose output, log every verification result
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Trace every manufacturer payload received
    #[arg(long)]
    pub debug_adv: bool,
}

impl Options {
    /// Check rules clap cannot express.
    ///
    /// # Errors
    /// Returns [`RunError::Config`] naming the offending option.
    pub fn validate(&self) -> Result<(), RunError> {
        if !self.base_url.starts_with("https://") {
            return Err(RunError::Config(format!(
                "--base-url must start with https:// (got {})",
                self.base_url
            )));
        }
        if self.gym_id == 0 {
            return Err(RunError::Config("--gym-id must be positive".to_string()));
        }
        if self.scanner_key.trim().is_empty() {
            return Err(RunError::Config("--scanner-key must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(RunError::Config("--poll-interval must be positive".to_string()));
        }
        if self.status_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(RunError::Config("--status-interval must be positive".to_string()));
        }
        if self.http_timeout.is_zero() {
            return Err(RunError::Config("--http-timeout must be positive".to_string()));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(RunError::Config(format!(
                "--queue-capacity must be at most {MAX_QUEUE_CAPACITY}"
            )));
        }
        if !looks_like_scanner_key(&self.scanner_key) {
            tracing::warn!("scanner key does not look like 64 hex characters; it was probably copied incompletely");
        }
        Ok(())
    }

    /// Event log location, falling back to the per-user data directory.
    pub fn log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| default_log_path(self.gym_id, &self.scanner_id))
    }

    pub fn event_log_config(&self) -> EventLogConfig {
        EventLogConfig {
            max_bytes: self.log_max_bytes.max(MIN_LOG_MAX_BYTES),
            backups: self.log_backups,
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            base_url: self.base_url.clone(),
            verify_path: self.verify_path.clone(),
            validate_path: self.validate_path.clone(),
            gym_id: self.gym_id,
            scanner_id: self.scanner_id.clone(),
            scanner_key: self.scanner_key.trim().to_string(),
            retry: RetryPolicy {
                attempts: self.http_retries.max(1),
                timeout: self.http_timeout,
                base_delay: self.retry_base_delay,
            },
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            strict_vendor: self.strict_vendor.then_some(self.vendor_id),
            debug_advertisements: self.debug_adv,
        }
    }
}

/// Parse a Bluetooth company id such as `76` or `0x004C`.
pub fn parse_company_id(src: &str) -> Result<u16, String> {
    let src = src.trim();
    let parsed = match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => src.parse(),
    };
    parsed.map_err(|_| format!("invalid company id: {src}"))
}

fn looks_like_scanner_key(key: &str) -> bool {
    let key = key.trim();
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Replace every run of characters outside `[A-Za-z0-9._-]` with `_`.
fn safe_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

fn default_log_path(gym_id: u64, scanner_id: &str) -> PathBuf {
    let dir = directories::ProjectDirs::from("", "", "attendance-scanner")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"));
    dir.join(format!("scanner_gym{gym_id}_{}.jsonl", safe_filename(scanner_id)))
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("scanner key validation failed, scanner will not start: {0}")]
    Credentials(#[from] CredentialError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Run with the compiled-in Bluetooth backend and the real HTTP client.
///
/// # Errors
/// See [`run_with`]; additionally fails when no backend is compiled in or the
/// HTTP client cannot be built.
pub async fn run(
    options: Options,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<DiagnosticsSnapshot, RunError> {
    let source: Arc<dyn AdvertisementSource> = Arc::from(crate::scanner::open(options.adapter.clone())?);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(options.http_timeout)?);
    run_with(options, source, transport, shutdown).await
}

/// Validate credentials, then scan and verify until `shutdown` resolves or the
/// advertisement stream ends.
///
/// When the stream ends on its own, frames already queued are still verified
/// before returning. When `shutdown` resolves, every task is aborted and
/// in-flight requests are abandoned.
///
/// # Errors
/// - [`RunError::Config`] for invalid options
/// - [`RunError::Io`] when the event log cannot be opened
/// - [`RunError::Credentials`] when the credential check fails; the source is
///   never subscribed in that case
/// - [`RunError::Scan`] when scanning cannot start
pub async fn run_with(
    options: Options,
    source: Arc<dyn AdvertisementSource>,
    transport: Arc<dyn Transport>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<DiagnosticsSnapshot, RunError> {
    options.validate()?;

    let diagnostics = Arc::new(Diagnostics::new());
    let log = Arc::new(EventLog::open(options.log_path(), options.event_log_config())?);
    let client = Arc::new(VerificationClient::new(
        transport,
        options.verifier_config(),
        diagnostics.clone(),
    ));

    tracing::info!(
        base_url = %options.base_url,
        gym_id = options.gym_id,
        scanner_id = %options.scanner_id,
        min_rssi = options.min_rssi,
        adapter = options.adapter.as_deref().unwrap_or("(default)"),
        log = %log.path().display(),
        http_timeout = ?options.http_timeout,
        http_retries = options.http_retries,
        "starting attendance scanner"
    );

    tracing::info!("validating scanner credentials");
    let check = client.validate_credentials().await;
    let record = match &check {
        Ok(check) => LogRecord::key_validation(
            options.gym_id,
            &options.scanner_id,
            true,
            Some(check.status_code),
            None,
        ),
        Err(error) => LogRecord::key_validation(
            options.gym_id,
            &options.scanner_id,
            false,
            error.status_code(),
            Some(error.to_string()),
        ),
    };
    append_record(&log, &record);
    let check = check?;

    match check.key_hint.as_deref() {
        Some(hint) if options.show_key_hint => tracing::info!(key_hint = hint, "scanner key accepted"),
        _ => tracing::info!("scanner key accepted"),
    }

    let (producer, consumer) = handoff_queue(options.queue_capacity);
    tracing::debug!(capacity = producer.capacity(), workers = options.workers.max(1), "verification queue ready");
    let throttle = ThrottleStore::new(options.throttle_window, options.min_rssi, diagnostics.clone());
    let pipeline = Arc::new(Pipeline::new(
        options.pipeline_config(),
        throttle,
        producer,
        diagnostics.clone(),
    ));

    let events = source.subscribe(diagnostics.clone()).await?;
    preflight(source.as_ref(), options.preflight, options.adapter.as_deref()).await?;
    tracing::info!("scanning for attendance beacons");

    let mut workers = JoinSet::new();
    for worker in 0..options.workers.max(1) {
        workers.spawn(verification_worker(
            worker,
            consumer.clone(),
            client.clone(),
            log.clone(),
            diagnostics.clone(),
            options.verbose,
        ));
    }
    drop(consumer);

    let mut capture = tokio::spawn(capture_loop(events, pipeline.clone()));
    let poller = tokio::spawn(poll_loop(
        source,
        pipeline,
        diagnostics.clone(),
        options.poll_interval,
    ));
    let status = options
        .status_interval
        .map(|interval| tokio::spawn(status_loop(diagnostics.clone(), interval)));

    let mut shutdown = std::pin::pin!(shutdown);
    tokio::select! {
        () = &mut shutdown => {
            tracing::info!("shutting down");
            capture.abort();
            poller.abort();
            workers.abort_all();
        }
        _ = &mut capture => {
            tracing::info!("advertisement stream ended, finishing queued verifications");
            // The poller holds the last producer; the queue closes once it is gone.
            poller.abort();
            let _ = poller.await;
            tokio::select! {
                () = drain(&mut workers) => {}
                () = &mut shutdown => {
                    tracing::info!("shutting down");
                    workers.abort_all();
                }
            }
        }
    }

    if let Some(status) = status {
        status.abort();
    }
    drain(&mut workers).await;

    Ok(diagnostics.snapshot())
}

/// Give the scanner a moment, then make sure the device cache can be read.
async fn preflight(
    source: &dyn AdvertisementSource,
    wait: Duration,
    adapter: Option<&str>,
) -> Result<(), RunError> {
    tokio::time::sleep(wait).await;
    match source.cached().await {
        Ok(devices) if devices.is_empty() => {
            tracing::warn!(
                adapter = adapter.unwrap_or("(default)"),
                "bluetooth preflight found 0 devices; check bluetoothd and scan permissions, or pick an adapter with --adapter"
            );
        }
        Ok(devices) => tracing::info!(devices = devices.len(), "bluetooth preflight ok"),
        Err(error) => {
            tracing::error!(%error, "bluetooth preflight failed; check `systemctl status bluetooth` and `bluetoothctl show`");
            return Err(error.into());
        }
    }
    Ok(())
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(error) = result
            && error.is_panic()
        {
            tracing::error!(%error, "verification worker panicked");
        }
    }
}

fn append_record(log: &EventLog, record: &LogRecord) {
    if let Err(error) = log.append(record) {
        tracing::warn!(path = %log.path().display(), %error, "failed to write event log");
    }
}

async fn capture_loop(mut events: mpsc::Receiver<Advertisement>, pipeline: Arc<Pipeline>) {
    while let Some(adv) = events.recv().await {
        pipeline.handle_advertisement(&adv, Origin::Capture);
    }
}

/// Re-read the scanner's device cache; catches sightings the event stream missed.
async fn poll_loop(
    source: Arc<dyn AdvertisementSource>,
    pipeline: Arc<Pipeline>,
    diagnostics: Arc<Diagnostics>,
    interval: Duration,
) {
    tokio::time::sleep(POLL_START_DELAY).await;
    loop {
        tokio::time::sleep(interval).await;
        match source.cached().await {
            Ok(devices) => {
                diagnostics.record_poll_cycle(devices.len());
                for adv in &devices {
                    pipeline.handle_advertisement(adv, Origin::Poll);
                }
            }
            Err(error) => {
                tracing::debug!(%error, "device cache poll failed");
                diagnostics.record_poll_error(format!("poll error: {error}"));
            }
        }
    }
}

async fn status_loop(diagnostics: Arc<Diagnostics>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snap = diagnostics.snapshot();
        tracing::info!(
            seen = snap.advertisements_seen,
            capture_dropped = snap.capture_dropped,
            with_vendor = snap.advertisements_with_vendor_data,
            marker = snap.marker_prefix_seen,
            decoded = snap.frames_decoded,
            throttle_keys = snap.throttle_keys,
            enqueued = snap.frames_enqueued,
            dropped = snap.frames_dropped_queue_full,
            sent = snap.verify_sent,
            ok = snap.verify_ok,
            err = snap.verify_err,
            poll_cycles = snap.poll_cycles,
            poll_devices = snap.poll_devices,
            last_status = ?snap.last_http_status,
            last_error = snap.last_error_message.as_deref().unwrap_or("-"),
            "status"
        );
    }
}

async fn verification_worker(
    worker: usize,
    queue: QueueConsumer,
    client: Arc<VerificationClient>,
    log: Arc<EventLog>,
    diagnostics: Arc<Diagnostics>,
    verbose: bool,
) {
    let gym_id = client.config().gym_id;
    let scanner_id = client.config().scanner_id.clone();

    while let Some(frame) = queue.dequeue().await {
        let outcome = client.verify(&frame).await;
        let (line, error) = match &outcome {
            VerificationOutcome::Ok { status_code, body } => {
                diagnostics.record_recent_verified(&frame, *status_code);
                (format!("[OK] {} token={} rssi={} -> {body}", frame.user_id(), frame.token(), frame.rssi()), None)
            }
            VerificationOutcome::Err { message, .. } => (
                format!("[ERR] {} token={} rssi={} -> {message}", frame.user_id(), frame.token(), frame.rssi()),
                Some(message.clone()),
            ),
        };
        append_record(
            &log,
            &LogRecord::verification(gym_id, &scanner_id, &frame, outcome.is_ok(), outcome.status_code(), error),
        );

        if verbose {
            tracing::info!(worker, "{line}");
        } else {
            tracing::debug!(worker, "{line}");
        }
    }

    tracing::debug!(worker, "verification queue closed");
}
