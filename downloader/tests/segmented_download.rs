//! Integration tests: segmented downloads against a local range-capable server.

mod common;

use std::time::Duration;

use common::range_server::{self, ServerOptions};
use smasher_downloader::{SegmentedDownloader, MAX_PARTS};
use smasher_shared::errors::DownloadError;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn pattern(len: usize) -> Vec<u8> {
    (0u8..251).cycle().take(len).collect()
}

fn downloader() -> SegmentedDownloader {
    SegmentedDownloader::new(reqwest::Client::new()).with_report_interval(Duration::from_millis(20))
}

#[tokio::test]
async fn multi_part_download_matches_body() {
    let body = pattern(64 * 1024 + 17);
    let url = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    let report = downloader()
        .download(&url, &dest, 4, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(report.parts, 4);
    assert_eq!(report.total_bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn more_parts_than_bytes_reduces_part_count() {
    let body = pattern(3);
    let url = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("tiny.bin");

    let report = downloader()
        .download(&url, &dest, 10, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(report.parts, 3);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn huge_part_count_is_capped() {
    let body = pattern(30_000);
    let url = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("capped.bin");

    let report = downloader()
        .download(&url, &dest, 30_000, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(report.parts, MAX_PARTS);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn empty_resource_yields_empty_file() {
    let url = range_server::start(Vec::new());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("empty.bin");

    let report = downloader()
        .download(&url, &dest, 8, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(report.parts, 0);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
}

#[tokio::test]
async fn blocked_head_falls_back_to_ranged_probe() {
    let body = pattern(10_000);
    let url = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            head_allowed: false,
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("nohead.bin");

    downloader()
        .download(&url, &dest, 3, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn unknown_size_is_rejected_before_writing() {
    let url = range_server::start_with_options(
        pattern(1000),
        ServerOptions {
            report_length: false,
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("unknown.bin");

    let err = downloader()
        .download(&url, &dest, 4, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::SizeUnknown { .. }), "got {:?}", err);
    assert!(!dest.exists());
}

#[tokio::test]
async fn ignored_range_fails_whole_transfer() {
    let body = pattern(8192);
    let url = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            support_ranges: false,
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("norange.bin");

    let err = downloader()
        .download(&url, &dest, 4, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::SegmentFetch { .. }), "got {:?}", err);
    // Partial file is left for the caller, at its pre-allocated size.
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), body.len() as u64);
}

#[tokio::test]
async fn single_part_accepts_full_response() {
    let body = pattern(4096);
    let url = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            support_ranges: false,
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("single.bin");

    downloader()
        .download(&url, &dest, 1, &CancellationToken::new(), None)
        .await
        .expect("download");

    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn progress_is_reported_until_complete() {
    let body = pattern(32 * 1024);
    let url = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("progress.bin");
    let (tx, mut rx) = mpsc::channel(256);

    downloader()
        .download(&url, &dest, 4, &CancellationToken::new(), Some(tx))
        .await
        .expect("download");

    let mut snapshots = Vec::new();
    while let Ok(snap) = rx.try_recv() {
        snapshots.push(snap);
    }
    let last = snapshots.last().expect("at least one snapshot");
    assert_eq!(last.percent, 100.0);
    assert_eq!(last.total, body.len() as f64);
    assert!(snapshots.windows(2).all(|w| w[0].done <= w[1].done));
}

#[tokio::test]
async fn zero_report_interval_still_reports() {
    let body = pattern(16 * 1024);
    let url = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("zero.bin");
    let (tx, mut rx) = mpsc::channel(1024);

    SegmentedDownloader::new(reqwest::Client::new())
        .with_report_interval(Duration::ZERO)
        .download(&url, &dest, 2, &CancellationToken::new(), Some(tx))
        .await
        .expect("download");

    let mut last = None;
    while let Ok(snap) = rx.try_recv() {
        last = Some(snap);
    }
    assert_eq!(last.expect("at least one snapshot").percent, 100.0);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn cancel_stops_segments_and_keeps_allocation() {
    let body = pattern(512 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            drip: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("cancelled.bin");
    let cancel = CancellationToken::new();

    let task = {
        let dest = dest.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { downloader().download(&url, &dest, 4, &cancel, None).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("download unwinds promptly")
        .expect("task joined");

    assert!(matches!(result, Err(DownloadError::Cancelled)), "got {:?}", result);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), body.len() as u64);
}
