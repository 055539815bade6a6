/// Media duration probe.
///
/// Asks the probe executable for the container duration and falls back to
/// scraping the `Duration:` banner the transcoder prints for `-i`.
use std::path::Path;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap()
});

#[derive(Debug, Clone)]
pub struct MediaProber {
    ffprobe_bin: String,
    ffmpeg_bin: String,
}

impl MediaProber {
    pub fn new(ffprobe_bin: impl Into<String>, ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    /// Duration of `path` in seconds, or None if neither method reports one.
    pub async fn duration(&self, path: &Path) -> Option<f64> {
        if let Some(secs) = self.probe_container(path).await {
            return Some(secs);
        }
        self.scrape_banner(path).await
    }

    async fn probe_container(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| debug!("{} unavailable: {}", self.ffprobe_bin, e))
            .ok()?;

        if !output.status.success() {
            debug!("{} exited with {}", self.ffprobe_bin, output.status);
            return None;
        }
        let secs = String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok()?;
        (secs.is_finite() && secs > 0.0).then_some(secs)
    }

    async fn scrape_banner(&self, path: &Path) -> Option<f64> {
        // Exits non-zero without an output file; only the banner matters.
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-i")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| debug!("{} unavailable: {}", self.ffmpeg_bin, e))
            .ok()?;

        parse_duration_banner(&String::from_utf8_lossy(&output.stderr))
    }
}

/// `Duration: 01:02:03.50, start: ...` -> 3723.5
pub fn parse_duration_banner(text: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(text)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}
