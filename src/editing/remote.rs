//! Stateless facade over the remote automation engine.
//!
//! Every call is keyed by subject id and normalized to [`RemoteError`]. The
//! proxy never retries; timeouts and retry policy belong to the caller.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwright_common::{CorrectionSet, Step};

use crate::errors::RemoteError;

// ── Wire types ───────────────────────────────────────────────────────

/// Request to open a live session for a subject.
#[derive(Debug, Clone, Serialize)]
pub struct OpenSession {
    pub url: String,
    pub document: CorrectionSet,
    pub is_login_step: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSession {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMatch {
    pub found: bool,
    pub match_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginFieldValue {
    pub field_name: String,
    pub field_selector: String,
    pub field_type: String,
    pub value: Option<String>,
}

/// Everything the engine needs to drive a login form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginRequest {
    pub fields: Vec<LoginFieldValue>,
    pub target_url: String,
    pub submit_selector: Option<String>,
    pub human_breakpoint: bool,
}

/// Phase of a login progress event. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Filling,
    Navigating,
    Captcha,
    #[serde(rename = "2fa")]
    TwoFactor,
    HumanBreakpoint,
    Done,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filling => "filling",
            Self::Navigating => "navigating",
            Self::Captcha => "captcha",
            Self::TwoFactor => "2fa",
            Self::HumanBreakpoint => "human_breakpoint",
            Self::Done => "done",
        }
    }

    /// Phases that stop automatic progress until a human resumes.
    pub fn needs_human(&self) -> bool {
        matches!(self, Self::Captcha | Self::TwoFactor | Self::HumanBreakpoint)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub discovered_steps: Vec<Step>,
}

/// One event on the login progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireProgress", into = "WireProgress")]
pub struct LoginProgress {
    pub phase: ProgressPhase,
    pub message: Option<String>,
    /// Present only on `done`.
    pub outcome: Option<LoginOutcome>,
}

/// Flat JSON shape of a progress line; outcome fields only mean something
/// on `done`.
#[derive(Serialize, Deserialize)]
struct WireProgress {
    phase: ProgressPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    discovered_steps: Vec<Step>,
}

impl From<WireProgress> for LoginProgress {
    fn from(w: WireProgress) -> Self {
        let outcome = (w.phase == ProgressPhase::Done).then(|| LoginOutcome {
            success: w.success.unwrap_or(false),
            error: w.error,
            final_url: w.final_url,
            discovered_steps: w.discovered_steps,
        });
        Self {
            phase: w.phase,
            message: w.message,
            outcome,
        }
    }
}

impl From<LoginProgress> for WireProgress {
    fn from(p: LoginProgress) -> Self {
        let outcome = p.outcome.unwrap_or_default();
        let is_done = p.phase == ProgressPhase::Done;
        Self {
            phase: p.phase,
            message: p.message,
            success: is_done.then_some(outcome.success),
            error: outcome.error,
            final_url: outcome.final_url,
            discovered_steps: outcome.discovered_steps,
        }
    }
}

impl LoginProgress {
    pub fn step(phase: ProgressPhase, message: Option<&str>) -> Self {
        Self {
            phase,
            message: message.map(str::to_string),
            outcome: None,
        }
    }

    pub fn done(outcome: LoginOutcome) -> Self {
        Self {
            phase: ProgressPhase::Done,
            message: None,
            outcome: Some(outcome),
        }
    }
}

pub type LoginProgressStream = BoxStream<'static, Result<LoginProgress, RemoteError>>;

// ── Engine trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait AutomationEngine: Send + Sync {
    async fn open(&self, subject_id: i64, req: OpenSession) -> Result<RemoteSession, RemoteError>;

    async fn close(&self, subject_id: i64) -> Result<(), RemoteError>;

    async fn send_command(
        &self,
        subject_id: i64,
        name: &str,
        payload: Value,
    ) -> Result<Value, RemoteError>;

    async fn navigate_step(
        &self,
        subject_id: i64,
        step_index: usize,
        url: &str,
    ) -> Result<(), RemoteError>;

    async fn fill_field(
        &self,
        subject_id: i64,
        field_index: usize,
        value: &str,
    ) -> Result<(), RemoteError>;

    async fn test_selector(
        &self,
        subject_id: i64,
        selector: &str,
    ) -> Result<SelectorMatch, RemoteError>;

    async fn read_field_value(
        &self,
        subject_id: i64,
        field_index: usize,
    ) -> Result<Option<String>, RemoteError>;

    async fn execute_login(
        &self,
        subject_id: i64,
        req: LoginRequest,
    ) -> Result<LoginProgressStream, RemoteError>;

    async fn resume_login(&self, subject_id: i64) -> Result<(), RemoteError>;
}

// ── HTTP engine ──────────────────────────────────────────────────────

/// Engine client speaking JSON over HTTP. Login progress arrives as
/// newline-delimited JSON on a streamed response.
pub struct HttpAutomationEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAutomationEngine {
    pub fn new(base_url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build engine HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn session_url(&self, subject_id: i64, suffix: &str) -> String {
        format!("{}/sessions/{}{}", self.base_url, subject_id, suffix)
    }

    async fn post_json(
        &self,
        subject_id: i64,
        suffix: &str,
        body: &impl Serialize,
    ) -> Result<reqwest::Response, RemoteError> {
        let resp = self
            .client
            .post(self.session_url(subject_id, suffix))
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(resp).await
    }

    async fn post_for<T: serde::de::DeserializeOwned>(
        &self,
        subject_id: i64,
        suffix: &str,
        body: &impl Serialize,
    ) -> Result<T, RemoteError> {
        let resp = self.post_json(subject_id, suffix, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Transport(format!("malformed engine reply: {}", e)))
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::timeout("engine request")
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// Normalize a non-success status to the matching failure mode.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(remote_error_for_status(status.as_u16(), &body))
}

pub fn remote_error_for_status(status: u16, body: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        404 | 410 => RemoteError::NotFound,
        408 | 504 => RemoteError::timeout("engine request"),
        400 | 422 => RemoteError::Rejected(message),
        _ => RemoteError::Transport(format!("engine returned {}: {}", status, message)),
    }
}

#[async_trait]
impl AutomationEngine for HttpAutomationEngine {
    async fn open(&self, subject_id: i64, req: OpenSession) -> Result<RemoteSession, RemoteError> {
        self.post_for(subject_id, "", &req).await
    }

    async fn close(&self, subject_id: i64) -> Result<(), RemoteError> {
        let resp = self
            .client
            .delete(self.session_url(subject_id, ""))
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(resp).await.map(|_| ())
    }

    async fn send_command(
        &self,
        subject_id: i64,
        name: &str,
        payload: Value,
    ) -> Result<Value, RemoteError> {
        let body = serde_json::json!({ "name": name, "payload": payload });
        let resp = self.post_json(subject_id, "/commands", &body).await?;
        let text = resp.text().await.map_err(map_transport_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Transport(format!("malformed engine reply: {}", e)))
    }

    async fn navigate_step(
        &self,
        subject_id: i64,
        step_index: usize,
        url: &str,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "step_index": step_index, "url": url });
        self.post_json(subject_id, "/navigate", &body).await.map(|_| ())
    }

    async fn fill_field(
        &self,
        subject_id: i64,
        field_index: usize,
        value: &str,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "field_index": field_index, "value": value });
        self.post_json(subject_id, "/fill", &body).await.map(|_| ())
    }

    async fn test_selector(
        &self,
        subject_id: i64,
        selector: &str,
    ) -> Result<SelectorMatch, RemoteError> {
        let body = serde_json::json!({ "selector": selector });
        self.post_for(subject_id, "/test-selector", &body).await
    }

    async fn read_field_value(
        &self,
        subject_id: i64,
        field_index: usize,
    ) -> Result<Option<String>, RemoteError> {
        #[derive(Deserialize)]
        struct FieldValue {
            value: Option<String>,
        }
        let body = serde_json::json!({ "field_index": field_index });
        let reply: FieldValue = self.post_for(subject_id, "/read-field", &body).await?;
        Ok(reply.value)
    }

    async fn execute_login(
        &self,
        subject_id: i64,
        req: LoginRequest,
    ) -> Result<LoginProgressStream, RemoteError> {
        let resp = self.post_json(subject_id, "/login", &req).await?;
        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_transport_error));
        Ok(ndjson_progress(bytes))
    }

    async fn resume_login(&self, subject_id: i64) -> Result<(), RemoteError> {
        self.post_json(subject_id, "/login/resume", &serde_json::json!({}))
            .await
            .map(|_| ())
    }
}

// ── NDJSON progress decoding ─────────────────────────────────────────

fn parse_progress_line(line: &str) -> Option<Result<LoginProgress, RemoteError>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(trimmed)
            .map_err(|e| RemoteError::Transport(format!("malformed progress event: {}", e))),
    )
}

struct LineDecoder<S> {
    chunks: S,
    buf: Vec<u8>,
    exhausted: bool,
}

/// Turn a stream of byte chunks into progress events, one per line. A
/// transport error is yielded once and ends the stream.
pub fn ndjson_progress<S, B>(chunks: S) -> LoginProgressStream
where
    S: Stream<Item = Result<B, RemoteError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let decoder = LineDecoder {
        chunks: chunks.boxed(),
        buf: Vec::new(),
        exhausted: false,
    };
    stream::unfold(decoder, |mut d| async move {
        loop {
            if let Some(pos) = d.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = d.buf.drain(..=pos).collect();
                if let Some(item) = parse_progress_line(&String::from_utf8_lossy(&line)) {
                    return Some((item, d));
                }
                continue;
            }
            if d.exhausted {
                let rest = std::mem::take(&mut d.buf);
                return parse_progress_line(&String::from_utf8_lossy(&rest)).map(|item| (item, d));
            }
            match d.chunks.next().await {
                Some(Ok(chunk)) => d.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    d.buf.clear();
                    d.exhausted = true;
                    return Some((Err(e), d));
                }
                None => d.exhausted = true,
            }
        }
    })
    .boxed()
}

// ── Test double ──────────────────────────────────────────────────────
