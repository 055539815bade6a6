/// Transcode supervisor.
///
/// Launches the transcoder with a private `-progress` artifact, polls that
/// artifact on a fixed interval to derive progress, and turns the child's
/// exit into a typed outcome. The artifact is removed on every exit path.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use smasher_shared::errors::TranscodeError;
use smasher_shared::models::{TranscodeReport, TranscodeStatus};
use smasher_shared::progress::{ProgressMeter, ProgressSnapshot};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::prober::MediaProber;
use super::processes::ProcessRegistry;
use super::progress_file::{parse_progress, ArtifactReading};
use super::{forward_stderr, terminate};

/// Default interval between reads of the progress artifact.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Notifications sent while a transcode runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeEvent {
    /// Input duration could not be determined; percent and ETA stay at 0.
    DurationUnknown,
    Progress {
        media_secs: f64,
        snapshot: ProgressSnapshot,
    },
}

/// One transcode of `input` into `output`.
#[derive(Debug)]
pub struct TranscodeJob {
    pub id: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub codec_params: String,
    status: TranscodeStatus,
}

impl TranscodeJob {
    pub fn new(input: PathBuf, output: PathBuf, codec_params: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input,
            output,
            codec_params: codec_params.into(),
            status: TranscodeStatus::Idle,
        }
    }

    pub fn status(&self) -> TranscodeStatus {
        self.status
    }

    /// Per-job progress artifact, next to the output.
    pub fn progress_path(&self) -> PathBuf {
        let dir = match self.output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        dir.join(format!("progress_{}.txt", self.id))
    }

    fn transition(&mut self, next: TranscodeStatus) {
        if self.status.is_terminal() {
            return;
        }
        debug!("Transcode {}: {} -> {}", self.id, self.status, next);
        self.status = next;
    }
}

#[derive(Clone)]
pub struct TranscodeSupervisor {
    ffmpeg_bin: String,
    prober: MediaProber,
    processes: ProcessRegistry,
    poll_interval: Duration,
    meter: ProgressMeter,
}

impl TranscodeSupervisor {
    pub fn new(ffmpeg_bin: impl Into<String>, prober: MediaProber, processes: ProcessRegistry) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            prober,
            processes,
            poll_interval: DEFAULT_POLL_INTERVAL,
            meter: ProgressMeter::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_meter(mut self, meter: ProgressMeter) -> Self {
        self.meter = meter;
        self
    }

    /// Run `job` to completion, failure, or cancellation.
    ///
    /// The job ends in exactly one terminal status. Events are offered to
    /// `events` without blocking; a lagging consumer loses samples.
    pub async fn run(
        &self,
        job: &mut TranscodeJob,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<TranscodeEvent>>,
    ) -> Result<TranscodeReport, TranscodeError> {
        let result = self.supervise(job, cancel, events.as_ref()).await;

        match &result {
            Ok(report) => {
                job.transition(TranscodeStatus::Succeeded);
                info!(
                    "Transcoded {} -> {} ({:.2} MB -> {:.2} MB, {:.1}% saved) in {:.1}s",
                    job.input.display(),
                    report.output.display(),
                    report.input_mb(),
                    report.output_mb(),
                    report.compression_ratio(),
                    report.elapsed_secs
                );
            }
            Err(e) if e.is_cancelled() => {
                job.transition(TranscodeStatus::Cancelled);
                info!("Transcode of {} cancelled", job.input.display());
            }
            Err(e) => {
                job.transition(TranscodeStatus::Failed);
                warn!("Transcode of {} failed: {}", job.input.display(), e);
            }
        }
        result
    }

    async fn supervise(
        &self,
        job: &mut TranscodeJob,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<TranscodeEvent>>,
    ) -> Result<TranscodeReport, TranscodeError> {
        let started = Instant::now();

        let input_size = match tokio::fs::metadata(&job.input).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => return Err(TranscodeError::InputMissing(job.input.clone())),
        };
        if let Some(parent) = job.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Cancelled either by the caller or by the process registry's terminate_all.
        let job_cancel = cancel.child_token();
        let slot = self
            .processes
            .register(&job.id, "transcoder", job_cancel.clone())
            .ok_or(TranscodeError::TooManyProcesses(self.processes.capacity()))?;

        let artifact = ArtifactGuard::create(job.progress_path()).await?;

        let duration = tokio::select! {
            biased;
            _ = job_cancel.cancelled() => return Err(TranscodeError::Cancelled),
            d = self.prober.duration(&job.input) => d,
        };
        if duration.is_none() {
            warn!(
                "Duration of {} unknown; progress will show processed time only",
                job.input.display()
            );
            emit(events, TranscodeEvent::DurationUnknown);
        }

        let mut child = Command::new(&self.ffmpeg_bin)
            .arg("-y")
            .arg("-i")
            .arg(&job.input)
            .args(split_params(&job.codec_params))
            .arg("-progress")
            .arg(artifact.path())
            .arg("-nostats")
            .args(["-loglevel", "error"])
            .arg(&job.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::ProcessLaunch(format!("{}: {}", self.ffmpeg_bin, e)))?;

        job.transition(TranscodeStatus::Running);
        slot.set_pid(child.id());
        info!(
            "Transcoding {} -> {} (pid {:?})",
            job.input.display(),
            job.output.display(),
            child.id()
        );
        let stderr_tail = child.stderr.take().map(|s| forward_stderr(s, "transcoder"));

        let launched = Instant::now();
        let total = duration.unwrap_or(0.0);
        let mut ticker = tokio::time::interval_at(launched + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                _ = job_cancel.cancelled() => {
                    terminate(&mut child, "transcoder").await;
                    return Err(TranscodeError::Cancelled);
                }
                status = child.wait() => {
                    let status = status?;
                    let reading = read_artifact(artifact.path()).await;
                    self.report(events, &reading, total, launched);
                    break status;
                }
                _ = ticker.tick() => {
                    let reading = read_artifact(artifact.path()).await;
                    self.report(events, &reading, total, launched);
                    if reading.is_end() {
                        debug!("Transcode {} reported end, waiting for exit", job.id);
                        break tokio::select! {
                            biased;
                            _ = job_cancel.cancelled() => {
                                terminate(&mut child, "transcoder").await;
                                return Err(TranscodeError::Cancelled);
                            }
                            status = child.wait() => status?,
                        };
                    }
                }
            }
        };
        drop(slot);

        let last_stderr = match stderr_tail {
            Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .flatten(),
            None => None,
        };

        let output_size = match tokio::fs::metadata(&job.output).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        match output_size {
            Some(output_size) if exit.success() => Ok(TranscodeReport {
                output: job.output.clone(),
                input_size,
                output_size,
                elapsed_secs: started.elapsed().as_secs_f64(),
                duration_secs: duration,
            }),
            _ => {
                if let Some(line) = last_stderr {
                    warn!("Transcoder stderr: {}", line);
                }
                Err(TranscodeError::ProcessExit {
                    code: exit.code(),
                    output_exists: output_size.is_some(),
                })
            }
        }
    }

    fn report(
        &self,
        events: Option<&mpsc::Sender<TranscodeEvent>>,
        reading: &ArtifactReading,
        total: f64,
        launched: Instant,
    ) {
        let media_secs = reading.media_secs();
        let snapshot = self.meter.render(media_secs, total, launched.elapsed());
        debug!("Transcode progress {} ({:.1}s of media)", snapshot, media_secs);
        emit(events, TranscodeEvent::Progress { media_secs, snapshot });
    }
}

fn emit(events: Option<&mpsc::Sender<TranscodeEvent>>, event: TranscodeEvent) {
    if let Some(tx) = events {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
            debug!("Transcode event consumer lagging, event dropped");
        }
    }
}

async fn read_artifact(path: &Path) -> ArtifactReading {
    match tokio::fs::read(path).await {
        Ok(bytes) => parse_progress(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            debug!("Progress artifact {} unreadable: {}", path.display(), e);
            ArtifactReading::default()
        }
    }
}

/// Owns the progress artifact and deletes it when dropped.
struct ArtifactGuard {
    path: PathBuf,
}

impl ArtifactGuard {
    async fn create(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::File::create(&path).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed progress artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove progress artifact {}: {}", self.path.display(), e),
        }
    }
}

/// Split codec parameters on whitespace, honouring single and double quotes.
pub fn split_params(params: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in params.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}
