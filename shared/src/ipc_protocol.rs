/// Control protocol spoken by the daemon.
///
/// Requests arrive as newline-delimited JSON on stdin; events leave as
/// newline-delimited JSON on stdout. Events carry plain status fields only,
/// formatting for any particular chat surface is the consumer's job.
use serde::{Deserialize, Serialize};

use crate::progress::ProgressSnapshot;

// ====== REQUEST (controller -> daemon) ======

/// Request read from the daemon's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Identity under which at most one task may be active.
    pub requester: String,
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local input file for `transcode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub params: RequestParams,
}

/// Supported control actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// List encodings offered by the extraction service.
    Formats,
    /// Fetch through the extraction service.
    Download,
    /// Fetch a plain URL with the segmented downloader.
    Direct,
    /// Route by link type.
    Auto,
    /// Re-encode a local file.
    Transcode,
    Cancel,
    CancelAll,
    Status,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Optional knobs for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<usize>,
    /// Re-encode after fetching.
    #[serde(default)]
    pub transcode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_params: Option<String>,
}

impl ControlRequest {
    pub fn new(requester: impl Into<String>, action: ControlAction) -> Self {
        Self {
            requester: requester.into(),
            action,
            url: None,
            input: None,
            params: RequestParams::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }

    /// Parse from a JSON line (from stdin).
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ====== EVENT (daemon -> controller) ======

/// Event written to the daemon's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Event types emitted by the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Accepted,
    Rejected,
    Formats,
    Progress,
    Warning,
    Done,
    Error,
    Cancelled,
    Status,
}

/// Pipeline phase label carried by progress events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extracting,
    Downloading,
    Transcoding,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Extracting => write!(f, "extracting"),
            Phase::Downloading => write!(f, "downloading"),
            Phase::Transcoding => write!(f, "transcoding"),
        }
    }
}

impl ControlEvent {
    pub fn new(requester: impl Into<String>, event: EventKind) -> Self {
        Self {
            requester: requester.into(),
            task_id: None,
            event,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Serialize to a single JSON line (for stdout).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            EventKind::Done | EventKind::Error | EventKind::Cancelled | EventKind::Rejected
        )
    }

    pub fn message(&self) -> Option<String> {
        self.data.get("message").and_then(|v| v.as_str()).map(String::from)
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.data.get("percent").and_then(|v| v.as_f64())
    }
}

// ====== CONVENIENCE BUILDERS ======

/// Build a progress event from a rendered snapshot.
pub fn progress_event(
    requester: &str,
    task_id: &str,
    phase: Phase,
    snapshot: &ProgressSnapshot,
) -> ControlEvent {
    ControlEvent::new(requester, EventKind::Progress)
        .with_task(task_id)
        .with_data(serde_json::json!({
            "phase": phase,
            "percent": snapshot.percent,
            "speed": snapshot.speed,
            "eta_secs": snapshot.eta_secs,
            "elapsed_secs": snapshot.elapsed_secs,
            "done": snapshot.done,
            "total": snapshot.total,
            "bar": snapshot.bar,
        }))
}

/// Build a plain message event (rejected, warning, error, cancelled).
pub fn message_event(
    requester: &str,
    task_id: Option<&str>,
    event: EventKind,
    message: impl Into<String>,
) -> ControlEvent {
    let mut ev = ControlEvent::new(requester, event)
        .with_data(serde_json::json!({ "message": message.into() }));
    ev.task_id = task_id.map(String::from);
    ev
}
