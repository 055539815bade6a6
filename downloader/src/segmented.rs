//! Segmented concurrent downloader.
//!
//! The destination file is pre-allocated to the full size, then every segment
//! fetches its own byte range through its own file handle positioned at the
//! segment start. Segments share nothing but an atomic byte counter, which a
//! separate reporter task samples on a fixed interval.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RANGE;
use reqwest::StatusCode;
use smasher_shared::errors::DownloadError;
use smasher_shared::models::DownloadReport;
use smasher_shared::progress::{ProgressMeter, ProgressSnapshot};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::probe_size;
use crate::segment::{plan_ranges, ByteRange};

/// Default interval between progress samples.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest accepted interval; `tokio::time::interval` rejects zero.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Splits one transfer into concurrent ranged fetches writing into a single file.
#[derive(Clone)]
pub struct SegmentedDownloader {
    client: reqwest::Client,
    report_interval: Duration,
    meter: ProgressMeter,
}

impl SegmentedDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            report_interval: DEFAULT_REPORT_INTERVAL,
            meter: ProgressMeter::default(),
        }
    }

    /// Intervals below `MIN_REPORT_INTERVAL` are raised to it.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval.max(MIN_REPORT_INTERVAL);
        self
    }

    pub fn with_meter(mut self, meter: ProgressMeter) -> Self {
        self.meter = meter;
        self
    }

    /// Download `url` into `destination` using up to `part_count` concurrent ranges.
    ///
    /// Progress snapshots are offered to `progress` every report interval; a full
    /// channel drops the sample rather than stalling the reporter. Any segment
    /// failure aborts the whole transfer. On failure or cancellation the partial
    /// file is left in place at its pre-allocated size.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        part_count: usize,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();

        let total = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            size = probe_size(&self.client, url) => size?,
        };

        preallocate(destination, total).await?;

        let ranges = plan_ranges(total, part_count);
        if ranges.is_empty() {
            info!("{} is empty, nothing to fetch", url);
            return Ok(DownloadReport {
                path: destination.to_path_buf(),
                total_bytes: 0,
                parts: 0,
                elapsed: started.elapsed(),
            });
        }

        info!(
            "Downloading {} ({} bytes) in {} part(s) to {}",
            url,
            total,
            ranges.len(),
            destination.display()
        );

        let transferred = Arc::new(AtomicU64::new(0));
        let segment_cancel = cancel.child_token();
        let reporter_stop = CancellationToken::new();

        let reporter = progress.map(|tx| {
            tokio::spawn(report_progress(
                transferred.clone(),
                total,
                self.meter.clone(),
                self.report_interval,
                tx,
                reporter_stop.clone(),
                started,
            ))
        });

        let whole_file = ranges.len() == 1;
        let parts = ranges.len();
        let mut segments = JoinSet::new();
        for range in ranges {
            segments.spawn(fetch_segment(
                self.client.clone(),
                url.to_string(),
                destination.to_path_buf(),
                range,
                whole_file,
                transferred.clone(),
                segment_cancel.clone(),
            ));
        }

        let mut failure: Option<DownloadError> = None;
        let mut interrupted = false;
        while let Some(joined) = segments.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(DownloadError::Cancelled),
                Err(e) => Err(DownloadError::Io(std::io::Error::other(format!(
                    "segment task panicked: {}",
                    e
                )))),
            };

            if let Err(e) = result {
                if e.is_cancelled() {
                    interrupted = true;
                } else if failure.is_none() {
                    warn!("Aborting {}: {}", url, e);
                    failure = Some(e);
                    segment_cancel.cancel();
                }
            }
        }

        reporter_stop.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        if let Err(e) = settle(failure, interrupted) {
            if e.is_cancelled() {
                info!("Download of {} cancelled", url);
            }
            return Err(e);
        }

        let elapsed = started.elapsed();
        info!("Downloaded {} ({} bytes) in {:.1}s", url, total, elapsed.as_secs_f64());
        Ok(DownloadReport {
            path: destination.to_path_buf(),
            total_bytes: total,
            parts,
            elapsed,
        })
    }
}

/// Outcome of a transfer once every segment has been joined.
///
/// A real segment failure wins over the cancellations it triggered. A transfer
/// whose segments all finished is complete even if cancellation arrived late.
fn settle(failure: Option<DownloadError>, interrupted: bool) -> Result<(), DownloadError> {
    match failure {
        Some(e) => Err(e),
        None if interrupted => Err(DownloadError::Cancelled),
        None => Ok(()),
    }
}

/// Create (or truncate) the destination and size it to exactly `total` bytes.
async fn preallocate(destination: &Path, total: u64) -> Result<(), DownloadError> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = tokio::fs::File::create(destination).await?;
    file.set_len(total).await?;
    file.sync_all().await?;
    debug!("Pre-allocated {} to {} bytes", destination.display(), total);
    Ok(())
}

async fn fetch_segment(
    client: reqwest::Client,
    url: String,
    destination: std::path::PathBuf,
    range: ByteRange,
    whole_file: bool,
    transferred: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<u64, DownloadError> {
    let fail = |reason: String| DownloadError::segment(range.start, range.last_byte(), reason);

    // Own handle, own cursor: no shared seek position between segments.
    let mut file = OpenOptions::new().write(true).open(&destination).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let request = client.get(&url).header(RANGE, range.header_value());
    let mut response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        resp = request.send() => resp.map_err(|e| fail(e.to_string()))?,
    };

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK if whole_file => {}
        StatusCode::OK => return Err(fail("server ignored the Range header".to_string())),
        status => return Err(fail(format!("HTTP {}", status))),
    }

    let expected = range.len();
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|e| fail(e.to_string()))?,
        };
        let Some(chunk) = chunk else { break };

        let len = chunk.len() as u64;
        if written + len > expected {
            return Err(fail(format!(
                "server sent more than the requested {} bytes",
                expected
            )));
        }
        file.write_all(&chunk).await?;
        written += len;
        transferred.fetch_add(len, Ordering::Relaxed);
    }

    if written != expected {
        return Err(fail(format!("short read: {} of {} bytes", written, expected)));
    }

    file.flush().await?;
    debug!("Segment {} complete ({} bytes)", range.header_value(), written);
    Ok(written)
}

async fn report_progress(
    transferred: Arc<AtomicU64>,
    total: u64,
    meter: ProgressMeter,
    interval: Duration,
    tx: mpsc::Sender<ProgressSnapshot>,
    stop: CancellationToken,
    started: Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let done = transferred.load(Ordering::Relaxed);
                let snapshot = meter.render_bytes(done, Some(total), started.elapsed());
                match tx.try_send(snapshot) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => debug!("Progress consumer lagging, sample dropped"),
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    let done = transferred.load(Ordering::Relaxed);
    let _ = tx.try_send(meter.render_bytes(done, Some(total), started.elapsed()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_completed_transfer_ignores_late_cancel() {
        assert!(settle(None, false).is_ok());
    }

    #[test]
    fn test_settle_reports_interrupted_segments_as_cancelled() {
        assert!(matches!(settle(None, true), Err(DownloadError::Cancelled)));
    }

    #[test]
    fn test_settle_prefers_segment_failure() {
        let err = settle(Some(DownloadError::segment(0, 99, "reset")), true).unwrap_err();
        assert!(matches!(err, DownloadError::SegmentFetch { start: 0, end: 99, .. }));
    }

    #[test]
    fn test_zero_report_interval_is_raised() {
        let d = SegmentedDownloader::new(reqwest::Client::new()).with_report_interval(Duration::ZERO);
        assert_eq!(d.report_interval, MIN_REPORT_INTERVAL);
    }
}
