/// Extraction service backed by yt-dlp.
///
/// Lists the encodings a streaming page offers and fetches one of them merged
/// with the best audio track. Runs are bounded by a semaphore so extraction
/// never starves the rest of the daemon, and every child is registered with
/// the process registry so a global cancel can reach it.
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use smasher_shared::errors::ExtractionError;
use smasher_shared::models::{Encoding, ExtractionProgress, MediaInfo};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::processes::{ProcessRegistry, ProcessSlot};
use super::{forward_stderr, terminate};

/// Marker yt-dlp prints in front of each JSON progress record.
pub const PROGRESS_PREFIX: &str = "smasher-progress:";

const DEFAULT_TITLE: &str = "No title available";
const MIN_HEIGHT: u32 = 360;

#[derive(Debug, Deserialize)]
struct RawInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    #[serde(default)]
    format_id: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    filesize: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    downloaded_bytes: Option<f64>,
    #[serde(default)]
    total_bytes: Option<f64>,
    #[serde(default)]
    total_bytes_estimate: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    eta: Option<f64>,
}

/// Keep video encodings of at least 360p whose size is known.
pub fn parse_media_info(url: &str, json: &[u8]) -> Result<MediaInfo, ExtractionError> {
    let raw: RawInfo =
        serde_json::from_slice(json).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

    let encodings: Vec<Encoding> = raw
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f.vcodec.as_deref() != Some("none"))
        .filter_map(|f| {
            let height = f.height.filter(|h| *h >= MIN_HEIGHT)?;
            let size = f.filesize.filter(|s| *s > 0.0)? as u64;
            Some(Encoding {
                id: f.format_id?,
                container: f.ext.unwrap_or_else(|| "unknown".to_string()),
                height,
                frame_rate: f.fps,
                size,
            })
        })
        .collect();

    if encodings.is_empty() {
        return Err(ExtractionError::NoFormats(url.to_string()));
    }

    Ok(MediaInfo {
        title: raw
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        encodings,
    })
}

/// Parse one `PROGRESS_PREFIX{...}` line; other output yields None.
pub fn parse_progress_line(line: &str) -> Option<ExtractionProgress> {
    let json = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let raw: RawProgress = serde_json::from_str(json).ok()?;
    let total = raw.total_bytes.or(raw.total_bytes_estimate).unwrap_or(0.0);
    Some(ExtractionProgress {
        downloaded_bytes: raw.downloaded_bytes.unwrap_or(0.0).max(0.0) as u64,
        total_bytes: total.max(0.0) as u64,
        speed: raw.speed.unwrap_or(0.0),
        eta: raw.eta.unwrap_or(0.0),
        status: raw.status.unwrap_or_default(),
    })
}

#[derive(Clone)]
pub struct YtDlpExtractor {
    bin: String,
    cookies: Option<PathBuf>,
    pool: Arc<Semaphore>,
    processes: ProcessRegistry,
}

impl YtDlpExtractor {
    pub fn new(
        bin: impl Into<String>,
        cookies: Option<PathBuf>,
        workers: usize,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            bin: bin.into(),
            cookies,
            pool: Arc::new(Semaphore::new(workers.max(1))),
            processes,
        }
    }

    /// Title and usable encodings for `url`.
    pub async fn list_encodings(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, ExtractionError> {
        let _permit = self.acquire(cancel).await?;
        let job_cancel = cancel.child_token();

        let mut cmd = self.command();
        cmd.arg("--dump-single-json").arg(url);
        let (mut child, _slot) = self.spawn_registered(cmd, &job_cancel)?;

        let stdout = child.stdout.take();
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });
        let stderr_tail = child.stderr.take().map(|s| forward_stderr(s, "extractor"));

        let status = wait_or_cancel(&mut child, &job_cancel).await?;
        let json = collector.await.map_err(std::io::Error::other)??;
        check_status(status, stderr_tail).await?;

        let url = url.to_string();
        let info = tokio::task::spawn_blocking(move || parse_media_info(&url, &json))
            .await
            .map_err(std::io::Error::other)??;
        debug!("{} offers {} usable encoding(s)", info.title, info.encodings.len());
        Ok(info)
    }

    /// Fetch `encoding_id` (plus best audio) of `url` into `output`.
    ///
    /// An existing `output` is returned as-is without running the extractor.
    pub async fn fetch(
        &self,
        url: &str,
        encoding_id: &str,
        output: &Path,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<ExtractionProgress>>,
    ) -> Result<PathBuf, ExtractionError> {
        if tokio::fs::try_exists(output).await.unwrap_or(false) {
            info!("{} already exists, skipping fetch", output.display());
            return Ok(output.to_path_buf());
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let _permit = self.acquire(cancel).await?;
        let job_cancel = cancel.child_token();

        // `-o` is an output template; literal percent signs must be doubled.
        let template = output.display().to_string().replace('%', "%%");
        let mut cmd = self.command();
        cmd.arg("-f")
            .arg(format!("{}+bestaudio/best", encoding_id))
            .args(["--merge-output-format", "mp4"])
            .arg("-o")
            .arg(template)
            .arg("--newline")
            .arg("--progress-template")
            .arg(format!("download:{}%(progress)j", PROGRESS_PREFIX))
            .arg(url);
        let (mut child, _slot) = self.spawn_registered(cmd, &job_cancel)?;
        info!("Fetching {} [{}] -> {}", url, encoding_id, output.display());

        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(update) = parse_progress_line(&line) else {
                    debug!(target: "child_process", "[extractor] {}", line);
                    continue;
                };
                if let Some(tx) = &progress {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(update) {
                        debug!("Extraction progress consumer lagging, sample dropped");
                    }
                }
            }
        });
        let stderr_tail = child.stderr.take().map(|s| forward_stderr(s, "extractor"));

        let status = wait_or_cancel(&mut child, &job_cancel).await;
        if status.is_err() {
            reader.abort();
        }
        let status = status?;
        let _ = reader.await;
        check_status(status, stderr_tail).await?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(ExtractionError::OutputMissing(output.to_path_buf()));
        }
        info!("Fetched {}", output.display());
        Ok(output.to_path_buf())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, ExtractionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
            permit = self.pool.clone().acquire_owned() => {
                permit.map_err(|_| ExtractionError::SpawnFailed("extraction pool closed".to_string()))
            }
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["--no-warnings", "--no-playlist"]);
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_registered(
        &self,
        mut cmd: Command,
        job_cancel: &CancellationToken,
    ) -> Result<(Child, ProcessSlot), ExtractionError> {
        let job_id = Uuid::new_v4().to_string();
        let slot = self
            .processes
            .register(&job_id, "extractor", job_cancel.clone())
            .ok_or_else(|| {
                ExtractionError::SpawnFailed(format!(
                    "process limit of {} reached",
                    self.processes.capacity()
                ))
            })?;
        let child = cmd
            .spawn()
            .map_err(|e| ExtractionError::SpawnFailed(format!("{}: {}", self.bin, e)))?;
        slot.set_pid(child.id());
        Ok((child, slot))
    }
}

async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ExtractionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(child, "extractor").await;
            info!("Extraction cancelled");
            Err(ExtractionError::Cancelled)
        }
        status = child.wait() => Ok(status?),
    }
}

async fn check_status(
    status: ExitStatus,
    stderr_tail: Option<tokio::task::JoinHandle<Option<String>>>,
) -> Result<(), ExtractionError> {
    if status.success() {
        return Ok(());
    }
    let last = match stderr_tail {
        Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .flatten(),
        None => None,
    };
    let message = last.unwrap_or_default();
    warn!("Extractor exited with {}: {}", status, message);
    Err(ExtractionError::ExitStatus(status.code(), message))
}
