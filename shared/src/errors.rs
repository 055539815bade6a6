/// Unified error types for the Smasher system.
use std::path::PathBuf;
use thiserror::Error;

use crate::models::TaskKind;

/// Top-level error type for the Smasher system.
#[derive(Debug, Error)]
pub enum SmasherError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SmasherError {
    /// Cancellation is cooperative and must not be reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SmasherError::Download(e) => e.is_cancelled(),
            SmasherError::Transcode(e) => e.is_cancelled(),
            SmasherError::Extraction(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Errors raised by the segmented downloader.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Server did not report a size for {url}; range splitting needs a known length")]
    SizeUnknown { url: String },

    #[error("Metadata probe failed: {0}")]
    Probe(String),

    #[error("Segment bytes={start}-{end} failed: {reason}")]
    SegmentFetch { start: u64, end: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    /// Build a segment failure for the inclusive range `start..=end`.
    pub fn segment(start: u64, end: u64, reason: impl Into<String>) -> Self {
        DownloadError::SegmentFetch {
            start,
            end,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the transcode supervisor.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Input file missing or empty: {0}")]
    InputMissing(PathBuf),

    #[error("Failed to launch transcoder: {0}")]
    ProcessLaunch(String),

    #[error("Transcoder exited with {} (output exists: {output_exists})", describe_code(.code))]
    ProcessExit {
        code: Option<i32>,
        output_exists: bool,
    },

    #[error("Too many running processes (limit {0})")]
    TooManyProcesses(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transcode cancelled")]
    Cancelled,
}

impl TranscodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranscodeError::Cancelled)
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}

/// Errors raised by the task registry.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Requester {key} already has an active {kind} task")]
    AlreadyActive { key: String, kind: TaskKind },
}

/// Errors raised by the external extraction service.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Failed to spawn extractor: {0}")]
    SpawnFailed(String),

    #[error("Extractor exited with code {0:?}: {1}")]
    ExitStatus(Option<i32>, String),

    #[error("Extractor returned invalid JSON: {0}")]
    InvalidJson(String),

    #[error("No usable encodings for {0}")]
    NoFormats(String),

    #[error("Extractor finished but output is missing: {0}")]
    OutputMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extraction cancelled")]
    Cancelled,
}

impl ExtractionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtractionError::Cancelled)
    }
}

/// Result type alias for Smasher operations.
pub type SmasherResult<T> = Result<T, SmasherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguishable() {
        let err: SmasherError = DownloadError::Cancelled.into();
        assert!(err.is_cancelled());

        let err: SmasherError = TranscodeError::Cancelled.into();
        assert!(err.is_cancelled());

        let err: SmasherError = TranscodeError::ProcessExit {
            code: Some(1),
            output_exists: false,
        }
        .into();
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_segment_error_carries_range() {
        let err = DownloadError::segment(10, 19, "connection reset");
        assert_eq!(err.to_string(), "Segment bytes=10-19 failed: connection reset");
    }

    #[test]
    fn test_process_exit_message() {
        let err = TranscodeError::ProcessExit {
            code: None,
            output_exists: false,
        };
        assert_eq!(
            err.to_string(),
            "Transcoder exited with a signal (output exists: false)"
        );
    }
}
