/// Data model shared across all Smasher crates.
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::{compression_ratio, to_mb};

/// Kind of work a requester can have in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    Transcode,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Download => write!(f, "download"),
            TaskKind::Transcode => write!(f, "transcode"),
        }
    }
}

/// Lifecycle of a transcode job.
///
/// `Idle -> Running -> {Succeeded, Failed, Cancelled}`; terminal states are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TranscodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscodeStatus::Succeeded | TranscodeStatus::Failed | TranscodeStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeStatus::Idle => write!(f, "idle"),
            TranscodeStatus::Running => write!(f, "running"),
            TranscodeStatus::Succeeded => write!(f, "succeeded"),
            TranscodeStatus::Failed => write!(f, "failed"),
            TranscodeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single encoding offered by the extraction service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Encoding {
    pub id: String,
    pub container: String,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub size: u64,
}

impl Encoding {
    /// Short label such as `720p (mp4, 30 FPS)`.
    pub fn label(&self) -> String {
        match self.frame_rate {
            Some(fps) => format!("{}p ({}, {} FPS)", self.height, self.container, fps.round()),
            None => format!("{}p ({}, N/A FPS)", self.height, self.container),
        }
    }
}

/// Title plus available encodings for a source URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub encodings: Vec<Encoding>,
}

/// Progress reported by the extraction service while it streams media.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionProgress {
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    /// Bytes per second.
    #[serde(default)]
    pub speed: f64,
    /// Seconds remaining.
    #[serde(default)]
    pub eta: f64,
    #[serde(default)]
    pub status: String,
}

/// Outcome of a completed segmented download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub parts: usize,
    pub elapsed: Duration,
}

/// Outcome of a successful transcode.
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeReport {
    pub output: PathBuf,
    pub input_size: u64,
    pub output_size: u64,
    pub elapsed_secs: f64,
    pub duration_secs: Option<f64>,
}

impl TranscodeReport {
    pub fn input_mb(&self) -> f64 {
        to_mb(self.input_size)
    }

    pub fn output_mb(&self) -> f64 {
        to_mb(self.output_size)
    }

    /// Percentage saved relative to the input; 0 for an empty input.
    pub fn compression_ratio(&self) -> f64 {
        compression_ratio(self.input_size, self.output_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TranscodeStatus::Idle.is_terminal());
        assert!(!TranscodeStatus::Running.is_terminal());
        assert!(TranscodeStatus::Succeeded.is_terminal());
        assert!(TranscodeStatus::Failed.is_terminal());
        assert!(TranscodeStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_report_ratio() {
        let report = TranscodeReport {
            output: PathBuf::from("out.mp4"),
            input_size: 100 * 1_048_576,
            output_size: 40 * 1_048_576,
            elapsed_secs: 12.0,
            duration_secs: None,
        };
        assert!((report.compression_ratio() - 60.0).abs() < 1e-9);
        assert!((report.input_mb() - 100.0).abs() < 1e-9);
        assert!((report.output_mb() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_encoding_label() {
        let enc = Encoding {
            id: "137".into(),
            container: "mp4".into(),
            height: 1080,
            frame_rate: Some(29.97),
            size: 1024,
        };
        assert_eq!(enc.label(), "1080p (mp4, 30 FPS)");
    }

    #[test]
    fn test_task_kind_serde() {
        let json = serde_json::to_string(&TaskKind::Transcode).unwrap();
        assert_eq!(json, "\"transcode\"");
    }
}
