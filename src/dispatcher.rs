#![forbid(unsafe_code)]

//! HTTP surface of the gateway and the per-request retrieval flow.
//!
//! A retrieval moves through validation, plan resolution, spawning and a
//! probe for the first stdout chunk. Everything up to the probe can still be
//! answered with a JSON error. Once the first chunk (or the end of the probe
//! window) arrives the 200 headers go out and a detached session task owns the
//! process until it is reaped, whether the client stays or not.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::{
    config::{DEFAULT_PROBE_TIMEOUT, GatewayConfig},
    diagnostics::{DEFAULT_DIAGNOSTIC_CAPACITY, DiagnosticSink},
    error::{ApiError, ApiResult, GatewayError},
    format::{FormatDescriptor, FormatPlan, FormatResolver},
    process::{ExtractionProcess, ProcessManager, ProcessState},
    relay::{self, BodySender, DEFAULT_BUFFER_CHUNKS, DEFAULT_CHUNK_SIZE, RelayOutcome},
    security::validate_source_url,
};

/// Longest stderr excerpt written to the log for a failed session.
const LOG_TAIL_BYTES: usize = 1024;

/// Timing and buffer knobs for streaming sessions.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub chunk_size: usize,
    pub buffer_chunks: usize,
    pub diagnostic_capacity: usize,
    /// How long to wait for the first stdout chunk before committing headers.
    pub probe_timeout: Duration,
    /// How long a child may linger after closing stdout.
    pub exit_timeout: Duration,
    /// How long to wait for stderr EOF once the child is gone.
    pub drain_timeout: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            chunk_size: config.relay_chunk_size,
            buffer_chunks: config.relay_buffer_chunks,
            diagnostic_capacity: config.diagnostic_capacity,
            probe_timeout: config.probe_timeout,
            ..Self::default()
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            exit_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Failed,
    ClientAborted,
}

/// Counters over every retrieval that got as far as spawning an extractor.
#[derive(Debug, Default)]
pub struct SessionStats {
    requests: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    client_aborted: AtomicU64,
}

impl SessionStats {
    fn next_request_id(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record(&self, end: SessionEnd) {
        let counter = match end {
            SessionEnd::Completed => &self.completed,
            SessionEnd::Failed => &self.failed,
            SessionEnd::ClientAborted => &self.client_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn client_aborted(&self) -> u64 {
        self.client_aborted.load(Ordering::Relaxed)
    }
}

/// Shared, read-mostly state handed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    formats: Arc<FormatResolver>,
    processes: ProcessManager,
    settings: Arc<RelaySettings>,
    stats: Arc<SessionStats>,
    default_format: Arc<str>,
    allowed_origins: Arc<[HeaderValue]>,
}

impl GatewayState {
    pub fn new(
        formats: FormatResolver,
        processes: ProcessManager,
        settings: RelaySettings,
        default_format: impl Into<String>,
    ) -> Self {
        let default_format: String = default_format.into();
        Self {
            formats: Arc::new(formats),
            processes,
            settings: Arc::new(settings),
            stats: Arc::new(SessionStats::default()),
            default_format: default_format.into(),
            allowed_origins: Arc::from(Vec::new()),
        }
    }

    /// Restricts browser access to `origins`. An empty list keeps the
    /// default of accepting any origin.
    pub fn with_allowed_origins(mut self, origins: &[String]) -> Result<Self> {
        let values = origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("origin '{origin}' is not a valid header value"))
            })
            .collect::<Result<Vec<_>>>()?;
        self.allowed_origins = values.into();
        Ok(self)
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let formats = config.format_resolver()?;
        let processes = ProcessManager::new(
            config.extractor_bin.clone(),
            config.max_extractions,
            config.kill_grace,
        );
        Self::new(
            formats,
            processes,
            RelaySettings::from_config(config),
            config.default_format.clone(),
        )
        .with_allowed_origins(&config.allowed_origins)
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrieveParams {
    pub url: Option<String>,
    pub format: Option<String>,
}

/// A validated retrieval: a checked source URL plus the plan it runs under.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub source_url: String,
    pub plan: Arc<FormatPlan>,
}

impl RetrievalRequest {
    /// An absent `format` selects `default_format`; a present but blank one is
    /// rejected like any other unknown token.
    pub fn from_params(
        params: RetrieveParams,
        formats: &FormatResolver,
        default_format: &str,
    ) -> Result<Self, GatewayError> {
        let source_url = validate_source_url(params.url.as_deref().unwrap_or_default())?;
        let token = params.format.as_deref().unwrap_or(default_format);
        let plan = formats.resolve(token)?;
        Ok(Self { source_url, plan })
    }
}

pub fn router(state: GatewayState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/retrieve", get(retrieve))
        .route("/api/retrieve", get(retrieve))
        .route("/api/formats", get(list_formats))
        .route("/api/health", get(health))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

/// Browser front ends fetch streams cross-origin and need the filename from
/// `Content-Disposition`.
fn cors_layer(origins: &[HeaderValue]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().cloned())
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .expose_headers([header::CONTENT_DISPOSITION])
}

async fn not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatsResponse {
    default_format: String,
    formats: Vec<FormatDescriptor>,
}

async fn list_formats(State(state): State<GatewayState>) -> ApiResult<Json<FormatsResponse>> {
    Ok(Json(FormatsResponse {
        default_format: state.default_format.to_string(),
        formats: state.formats.descriptors(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    active_extractions: usize,
    max_extractions: usize,
    spawned_total: u64,
    completed: u64,
    failed: u64,
    client_aborted: u64,
}

async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "online",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        active_extractions: state.processes.active(),
        max_extractions: state.processes.capacity(),
        spawned_total: state.processes.spawned_total(),
        completed: state.stats.completed(),
        failed: state.stats.failed(),
        client_aborted: state.stats.client_aborted(),
    })
}

async fn retrieve(
    State(state): State<GatewayState>,
    query: Result<Query<RetrieveParams>, QueryRejection>,
) -> Response {
    let span = info_span!(
        "retrieve",
        request = state.stats.next_request_id(),
        format = tracing::field::Empty
    );
    async move {
        let result = match query {
            Ok(Query(params)) => dispatch(&state, params).await,
            Err(rejection) => Err(GatewayError::invalid_request(rejection.body_text())),
        };
        match result {
            Ok(response) => response,
            Err(err) => {
                log_rejection(&err);
                ApiError::from(err).into_response()
            }
        }
    }
    .instrument(span)
    .await
}

fn log_rejection(err: &GatewayError) {
    match err {
        GatewayError::InvalidRequest { .. } | GatewayError::InvalidFormat { .. } => {
            debug!("rejected: {err}")
        }
        GatewayError::ResourceExhausted { .. } => warn!("{err}"),
        // Already logged with the stderr tail when the session failed.
        GatewayError::ExtractionFailure { .. } => {}
        GatewayError::Spawn { .. } | GatewayError::Internal(_) => {
            error!("{err}")
        }
    }
}

async fn dispatch(state: &GatewayState, params: RetrieveParams) -> Result<Response, GatewayError> {
    let request = RetrievalRequest::from_params(params, &state.formats, &state.default_format)?;
    Span::current().record("format", request.plan.token.as_str());
    let headers = stream_headers(&request.plan)?;
    let settings = state.settings.clone();

    let mut process = state.processes.start(&request.source_url, &request.plan)?;
    let diagnostics = match process.take_stderr() {
        Some(stderr) => DiagnosticSink::spawn(stderr, settings.diagnostic_capacity),
        None => DiagnosticSink::detached(settings.diagnostic_capacity),
    };
    let stdout = process
        .take_stdout()
        .ok_or_else(|| GatewayError::Internal("extractor stdout was not captured".into()))?;
    let mut source = relay::chunked(stdout, settings.chunk_size);

    let guard = ProbeGuard::new(state.stats.clone());
    let probe = tokio::time::timeout(settings.probe_timeout, source.next()).await;
    guard.disarm();

    let first = match probe {
        Ok(Some(Ok(chunk))) => Some(chunk),
        Ok(Some(Err(err))) => {
            let reason = format!("reading extractor output failed: {err}");
            return Err(abandon(process, diagnostics, &settings, &state.stats, reason).await);
        }
        Ok(None) => {
            return Err(fail_without_output(process, diagnostics, &settings, &state.stats).await);
        }
        Err(_) => {
            debug!(
                "no output within {:?}; committing headers anyway",
                settings.probe_timeout
            );
            None
        }
    };

    let (sink, body) = relay::body_channel(settings.buffer_chunks);
    let mut sent = 0u64;
    if let Some(chunk) = first {
        sent = chunk.len() as u64;
        // Fresh channel with room for at least one chunk.
        let _ = sink.try_send(Ok(chunk));
    }
    info!(extraction = process.id(), url = %request.source_url, "streaming started");

    let session = Session {
        process,
        diagnostics,
        source,
        sink,
        sent,
        settings,
        stats: state.stats.clone(),
    };
    tokio::spawn(session.run().in_current_span());

    Ok((headers, body).into_response())
}

fn stream_headers(plan: &FormatPlan) -> Result<HeaderMap, GatewayError> {
    let invalid = |what: &str| {
        GatewayError::Internal(format!(
            "{what} for format '{}' is not a valid header value",
            plan.token
        ))
    };
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&plan.content_type).map_err(|_| invalid("content type"))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&plan.content_disposition())
            .map_err(|_| invalid("content disposition"))?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(headers)
}

/// Counts a disconnect that happens while the handler is still probing. The
/// handler future is dropped in that case, and with it the process, whose
/// `Drop` kills the group.
struct ProbeGuard {
    stats: Arc<SessionStats>,
    armed: bool,
}

impl ProbeGuard {
    fn new(stats: Arc<SessionStats>) -> Self {
        Self { stats, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            info!("client went away before the stream started");
            self.stats.record(SessionEnd::ClientAborted);
        }
    }
}

/// stdout closed before producing a byte: collect the exit status and the
/// stderr text for the error response.
async fn fail_without_output(
    mut process: ExtractionProcess,
    diagnostics: DiagnosticSink,
    settings: &RelaySettings,
    stats: &SessionStats,
) -> GatewayError {
    let state = match process.wait_timeout(settings.probe_timeout).await {
        Ok(Some(state)) => state,
        Ok(None) => process.terminate().await.unwrap_or(ProcessState::Killed),
        Err(err) => {
            let reason = format!("waiting for extractor failed: {err}");
            return abandon(process, diagnostics, settings, stats, reason).await;
        }
    };
    let message = failure_message(state);
    let text = diagnostics.finish(settings.drain_timeout).await.text();
    warn!(
        extraction = process.id(),
        stderr = log_tail(&text),
        "{message}"
    );
    stats.record(SessionEnd::Failed);
    drop(process);
    GatewayError::extraction_failure(message, (!text.is_empty()).then_some(text))
}

async fn abandon(
    mut process: ExtractionProcess,
    diagnostics: DiagnosticSink,
    settings: &RelaySettings,
    stats: &SessionStats,
    reason: String,
) -> GatewayError {
    if let Err(err) = process.terminate().await {
        warn!(extraction = process.id(), "terminating extractor failed: {err}");
    }
    let text = diagnostics.finish(settings.drain_timeout).await.text();
    warn!(extraction = process.id(), stderr = log_tail(&text), "{reason}");
    stats.record(SessionEnd::Failed);
    GatewayError::extraction_failure(reason, (!text.is_empty()).then_some(text))
}

fn failure_message(state: ProcessState) -> String {
    match state {
        ProcessState::ExitedOk => "extractor produced no output".to_string(),
        ProcessState::ExitedError(Some(code)) => format!("extractor exited with code {code}"),
        ProcessState::ExitedError(None) => "extractor was killed by a signal".to_string(),
        ProcessState::Killed => "extractor was stopped before finishing".to_string(),
        ProcessState::Running => "extractor is still running".to_string(),
    }
}

fn log_tail(text: &str) -> &str {
    if text.len() <= LOG_TAIL_BYTES {
        return text;
    }
    let mut start = text.len() - LOG_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Everything a committed response needs until the extractor is reaped.
struct Session {
    process: ExtractionProcess,
    diagnostics: DiagnosticSink,
    source: ReaderStream<ChildStdout>,
    sink: BodySender,
    sent: u64,
    settings: Arc<RelaySettings>,
    stats: Arc<SessionStats>,
}

impl Session {
    async fn run(self) {
        let Self {
            mut process,
            diagnostics,
            source,
            sink,
            sent,
            settings,
            stats,
        } = self;

        let outcome = relay::relay(source, &sink).await;
        let bytes = sent + outcome.bytes();
        let failure = match outcome {
            RelayOutcome::Completed { .. } => {
                match process.wait_timeout(settings.exit_timeout).await {
                    Ok(Some(ProcessState::ExitedOk)) => None,
                    Ok(Some(state)) => Some(failure_message(state)),
                    Ok(None) => {
                        stop(&mut process).await;
                        Some("extractor did not exit after closing its output".to_string())
                    }
                    Err(err) => {
                        stop(&mut process).await;
                        Some(format!("waiting for extractor failed: {err}"))
                    }
                }
            }
            RelayOutcome::ClientAborted { .. } => {
                stop(&mut process).await;
                drop(sink);
                diagnostics.finish(settings.drain_timeout).await;
                info!(
                    extraction = process.id(),
                    bytes, "client disconnected; extractor stopped"
                );
                stats.record(SessionEnd::ClientAborted);
                return;
            }
            RelayOutcome::SourceFailed { error, .. } => {
                stop(&mut process).await;
                Some(format!("reading extractor output failed: {error}"))
            }
        };

        if let Some(reason) = &failure {
            relay::truncate(&sink, reason.clone()).await;
        }
        drop(sink);
        let text = diagnostics.finish(settings.drain_timeout).await.text();

        match failure {
            None => {
                info!(extraction = process.id(), bytes, "retrieval completed");
                stats.record(SessionEnd::Completed);
            }
            Some(reason) => {
                warn!(
                    extraction = process.id(),
                    bytes,
                    stderr = log_tail(&text),
                    "stream truncated: {reason}"
                );
                stats.record(SessionEnd::Failed);
            }
        }
    }
}

async fn stop(process: &mut ExtractionProcess) {
    if let Err(err) = process.terminate().await {
        warn!(extraction = process.id(), "terminating extractor failed: {err}");
    }
}
