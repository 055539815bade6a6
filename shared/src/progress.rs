/// Progress math and human-readable formatting.
///
/// Everything here is pure: a snapshot is derived from `(done, total, elapsed)`
/// on demand and never stored, so repeated renders cannot drift.
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Bytes in one MB for size and ratio reporting.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Default bar width in glyphs.
pub const DEFAULT_BAR_WIDTH: usize = 10;

const FILLED_GLYPH: char = '⬢';
const EMPTY_GLYPH: char = '⬡';

/// Renders progress snapshots with a fixed-width bar.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    width: usize,
    filled: char,
    empty: char,
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new(DEFAULT_BAR_WIDTH)
    }
}

impl ProgressMeter {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            filled: FILLED_GLYPH,
            empty: EMPTY_GLYPH,
        }
    }

    pub fn with_glyphs(mut self, filled: char, empty: char) -> Self {
        self.filled = filled;
        self.empty = empty;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Derive percent, speed, ETA and bar from cumulative progress.
    ///
    /// `total <= 0` means unknown: percent and ETA are reported as 0.
    /// ETA is `elapsed * (total - done) / done`, i.e. remaining work at the
    /// average throughput observed so far.
    pub fn render(&self, done: f64, total: f64, elapsed: Duration) -> ProgressSnapshot {
        let elapsed_secs = elapsed.as_secs_f64();
        let done = done.max(0.0);
        let known = total > 0.0;

        let percent = if known {
            (done / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let speed = if elapsed_secs > 0.0 { done / elapsed_secs } else { 0.0 };
        let eta_secs = if known && done > 0.0 {
            elapsed_secs * (total - done).max(0.0) / done
        } else {
            0.0
        };

        ProgressSnapshot {
            done,
            total: if known { total } else { 0.0 },
            percent,
            speed,
            eta_secs,
            elapsed_secs,
            bar: self.bar(percent),
        }
    }

    /// Convenience wrapper for byte counters.
    pub fn render_bytes(&self, done: u64, total: Option<u64>, elapsed: Duration) -> ProgressSnapshot {
        self.render(done as f64, total.unwrap_or(0) as f64, elapsed)
    }

    /// `floor(width * percent / 100)` filled glyphs, the rest empty.
    pub fn bar(&self, percent: f64) -> String {
        let percent = percent.clamp(0.0, 100.0);
        let filled = ((self.width as f64) * percent / 100.0).floor() as usize;
        let filled = filled.min(self.width);
        let mut bar = String::with_capacity(self.width * 3);
        bar.extend(std::iter::repeat(self.filled).take(filled));
        bar.extend(std::iter::repeat(self.empty).take(self.width - filled));
        bar
    }
}

/// A rendered progress sample. Derived, never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub done: f64,
    /// 0 when unknown.
    pub total: f64,
    pub percent: f64,
    /// Units of `done` per second.
    pub speed: f64,
    pub eta_secs: f64,
    pub elapsed_secs: f64,
    pub bar: String,
}

impl ProgressSnapshot {
    /// Projected total wall time: elapsed plus ETA.
    pub fn estimated_total_secs(&self) -> f64 {
        self.elapsed_secs + self.eta_secs
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {:.1}%", self.bar, self.percent)
    }
}

/// Reporting-side rate limit: at most one render per interval.
///
/// Producers may bump their counters continuously; only the reporter consults this.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Returns true (and arms the throttle) if a render is allowed now.
    /// The first call always passes.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Convert bytes to MB (1 MB = 1,048,576 bytes).
pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// `(1 - output/input) * 100`, or 0 when the input is empty.
pub fn compression_ratio(input_size: u64, output_size: u64) -> f64 {
    if input_size == 0 {
        return 0.0;
    }
    (1.0 - output_size as f64 / input_size as f64) * 100.0
}

/// Format seconds as `H:MM:SS`, prefixing whole days as `N day(s), `.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let days = total / 86_400;
    let rem = total % 86_400;
    let clock = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        n => format!("{} days, {}", n, clock),
    }
}

/// Format a byte count with two decimals in 1024 steps, e.g. `1.50 MB`.
pub fn format_size(bytes: f64) -> String {
    if bytes <= 0.0 || !bytes.is_finite() {
        return "0B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
