/// Request handling: admit, fetch, transcode, deliver, retire.
///
/// Every task-starting request is admitted into the `TaskRegistry` before any
/// work is spawned. The admitted task owns a `TaskHandle` and a `ScratchFiles`
/// set; dropping them on any exit path (success, failure, cancellation, panic)
/// retires the requester's key and removes the files nobody took ownership of.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use smasher_downloader::{SegmentedDownloader, MAX_PARTS};
use smasher_shared::errors::{SmasherError, SmasherResult};
use smasher_shared::ipc_protocol::{
    message_event, progress_event, ControlAction, ControlEvent, ControlRequest, EventKind, Phase,
};
use smasher_shared::models::{ExtractionProgress, MediaInfo, TaskKind, TranscodeReport};
use smasher_shared::progress::{format_size, format_time, ProgressMeter, ProgressSnapshot, ProgressThrottle};
use smasher_shared::task_registry::{TaskHandle, TaskRegistry};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delivery::Delivery;
use crate::link_detector::{
    self, compressed_name, file_name_from_url, sanitize_title, SourceKind, DEFAULT_FILE_NAME,
};
use crate::workers::extractor::YtDlpExtractor;
use crate::workers::prober::MediaProber;
use crate::workers::processes::ProcessRegistry;
use crate::workers::transcoder::{TranscodeEvent, TranscodeJob, TranscodeSupervisor};

/// Encoding requested from the extractor when the request names none.
const DEFAULT_ENCODING: &str = "bestvideo";

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: Config,
    pub registry: TaskRegistry,
    pub processes: ProcessRegistry,
    pub downloader: SegmentedDownloader,
    pub extractor: YtDlpExtractor,
    pub transcoder: TranscodeSupervisor,
    pub meter: ProgressMeter,
    pub delivery: Arc<dyn Delivery>,
    /// Every spawned request handler, until its future completes.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(config: Config, delivery: Arc<dyn Delivery>) -> SmasherResult<Self> {
        let meter = ProgressMeter::new(config.bar_width);
        let processes = ProcessRegistry::new(config.max_processes);

        let client = reqwest::Client::builder()
            .user_agent(concat!("smasher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SmasherError::Config(format!("HTTP client: {}", e)))?;
        // Sample often; delivery is throttled separately.
        let sample_every = config
            .progress_interval
            .clamp(Duration::from_millis(100), Duration::from_secs(1));
        let downloader = SegmentedDownloader::new(client)
            .with_report_interval(sample_every)
            .with_meter(meter.clone());

        let prober = MediaProber::new(&config.ffprobe_bin, &config.ffmpeg_bin);
        let transcoder = TranscodeSupervisor::new(&config.ffmpeg_bin, prober, processes.clone())
            .with_poll_interval(config.transcode_poll_interval)
            .with_meter(meter.clone());
        let extractor = YtDlpExtractor::new(
            &config.ytdlp_bin,
            config.cookies_path.clone(),
            config.extract_workers,
            processes.clone(),
        );

        Ok(Self {
            config,
            registry: TaskRegistry::new(),
            processes,
            downloader,
            extractor,
            transcoder,
            meter,
            delivery,
            tasks: TaskTracker::new(),
        })
    }

    fn emit(&self, event: ControlEvent) {
        self.delivery.deliver(event);
    }

    /// Cancel every task and signal every child process. Returns both counts.
    pub fn cancel_all(&self) -> (usize, usize) {
        let tasks = self.registry.cancel_all();
        let processes = self.processes.terminate_all();
        (tasks, processes)
    }

    /// Wait until every spawned handler has finished and no child is registered.
    ///
    /// Cancelled tasks leave the registry at once but stay tracked until they
    /// have emitted their final event.
    pub async fn wait_idle(&self, poll: Duration) {
        while !self.tasks.is_empty() || self.registry.active_count() > 0 || !self.processes.is_empty() {
            tokio::time::sleep(poll).await;
        }
    }
}

/// What an admitted task will do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Direct { url: String, file_name: String },
    Extracted { url: String },
    Transcode { input: PathBuf },
}

impl Plan {
    fn kind(&self) -> TaskKind {
        match self {
            Plan::Transcode { .. } => TaskKind::Transcode,
            _ => TaskKind::Download,
        }
    }
}

fn plan(request: &ControlRequest) -> Result<Plan, String> {
    let action = request.action;
    if action == ControlAction::Transcode {
        return request
            .input
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .map(|i| Plan::Transcode { input: PathBuf::from(i) })
            .ok_or_else(|| "transcode requires an input path".to_string());
    }
    if !matches!(action, ControlAction::Direct | ControlAction::Download | ControlAction::Auto) {
        return Err(format!("{} does not start a task", action));
    }

    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| format!("{} requires a url", action))?;
    let source = link_detector::classify(url).ok_or_else(|| format!("{} is not an http(s) URL", url))?;

    let extract = match action {
        ControlAction::Direct => false,
        ControlAction::Download => true,
        _ => source.is_extractable(),
    };
    let url = source.url().to_string();
    Ok(match source {
        _ if extract => Plan::Extracted { url },
        SourceKind::Direct { file_name, .. } => Plan::Direct { url, file_name },
        SourceKind::Extractable { host, .. } => {
            debug!("Fetching {} from {} without the extractor", url, host);
            Plan::Direct {
                file_name: file_name_from_url(&url),
                url,
            }
        }
    })
}

/// Route one control request. Long-running work is spawned; this returns promptly.
pub fn dispatch(state: &Arc<AppState>, request: ControlRequest) {
    let requester = request.requester.clone();
    debug!("Request from {}: {}", requester, request.action);

    match request.action {
        ControlAction::Status => state.emit(status_event(state, &requester)),
        ControlAction::Cancel => {
            if state.registry.cancel(&requester) {
                info!("Cancel requested by {}", requester);
            } else {
                state.emit(message_event(
                    &requester,
                    None,
                    EventKind::Warning,
                    "No ongoing tasks to cancel.",
                ));
            }
        }
        ControlAction::CancelAll => {
            let (tasks, processes) = state.cancel_all();
            info!("Cancel-all from {}: {} task(s), {} process(es)", requester, tasks, processes);
            state.emit(ControlEvent::new(&requester, EventKind::Status).with_data(json!({
                "cancelled_tasks": tasks,
                "terminated_processes": processes,
            })));
        }
        ControlAction::Formats => {
            let tasks = state.tasks.clone();
            let state = state.clone();
            tasks.spawn(async move { list_formats(state, request).await });
        }
        ControlAction::Download | ControlAction::Direct | ControlAction::Auto | ControlAction::Transcode => {
            admit_and_spawn(state, request)
        }
    }
}

fn admit_and_spawn(state: &Arc<AppState>, request: ControlRequest) {
    let requester = request.requester.clone();
    let plan = match plan(&request) {
        Ok(plan) => plan,
        Err(reason) => {
            warn!("Rejected {} from {}: {}", request.action, requester, reason);
            state.emit(message_event(&requester, None, EventKind::Rejected, reason));
            return;
        }
    };

    let handle = match state.registry.admit(&requester, plan.kind()) {
        Ok(handle) => handle,
        Err(e) => {
            state.emit(message_event(&requester, None, EventKind::Rejected, e.to_string()));
            return;
        }
    };

    info!("Task {} admitted for {}: {:?}", handle.task_id(), requester, plan);
    state.emit(
        ControlEvent::new(&requester, EventKind::Accepted)
            .with_task(handle.task_id())
            .with_data(json!({ "action": request.action, "kind": plan.kind() })),
    );

    let tasks = state.tasks.clone();
    let state = state.clone();
    tasks.spawn(async move { run_task(state, request, plan, handle).await });
}

async fn run_task(state: Arc<AppState>, request: ControlRequest, plan: Plan, handle: TaskHandle) {
    let requester = handle.key().to_string();
    let task_id = handle.task_id().to_string();
    let mut scratch = ScratchFiles::default();

    match execute(&state, &request, &plan, &handle, &mut scratch).await {
        Ok((path, data)) => {
            scratch.keep(&path);
            info!("Task {} for {} done: {}", task_id, requester, path.display());
            state.emit(
                ControlEvent::new(&requester, EventKind::Done)
                    .with_task(&task_id)
                    .with_data(data),
            );
        }
        Err(e) if e.is_cancelled() => {
            info!("Task {} for {} cancelled", task_id, requester);
            state.emit(message_event(&requester, Some(&task_id), EventKind::Cancelled, "Task cancelled."));
        }
        Err(e) => {
            error!("Task {} for {} failed: {}", task_id, requester, e);
            state.emit(message_event(&requester, Some(&task_id), EventKind::Error, e.to_string()));
        }
    }

    // Release files first so a requester that sees its key free finds a clean slate.
    drop(scratch);
    drop(handle);
}

/// Fetch the source (unless supplied), optionally transcode, and describe the artifact.
async fn execute(
    state: &AppState,
    request: &ControlRequest,
    plan: &Plan,
    handle: &TaskHandle,
    scratch: &mut ScratchFiles,
) -> SmasherResult<(PathBuf, serde_json::Value)> {
    let started = Instant::now();
    let mut data = serde_json::Map::new();

    let source = match plan {
        Plan::Direct { url, file_name } => {
            fetch_direct(state, request, handle, url, file_name, scratch, &mut data).await?
        }
        Plan::Extracted { url } => fetch_extracted(state, request, handle, url, scratch, &mut data).await?,
        Plan::Transcode { input } => input.clone(),
    };

    let artifact = if matches!(plan, Plan::Transcode { .. }) || request.params.transcode {
        let report = transcode(state, request, handle, &source, scratch).await?;
        data.insert(
            "transcode".to_string(),
            json!({
                "input_mb": round2(report.input_mb()),
                "output_mb": round2(report.output_mb()),
                "compression_ratio": round2(report.compression_ratio()),
                "total_time": format_time(report.elapsed_secs),
                "duration_secs": report.duration_secs,
            }),
        );
        report.output
    } else {
        source
    };

    let size = tokio::fs::metadata(&artifact).await.map(|m| m.len()).unwrap_or(0);
    let elapsed = started.elapsed().as_secs_f64();
    data.insert("path".to_string(), json!(artifact.display().to_string()));
    data.insert(
        "file_name".to_string(),
        json!(artifact.file_name().map(|n| n.to_string_lossy().into_owned())),
    );
    data.insert("size".to_string(), json!(size));
    data.insert("size_human".to_string(), json!(format_size(size as f64)));
    data.insert("elapsed_secs".to_string(), json!(round2(elapsed)));
    data.insert("elapsed".to_string(), json!(format_time(elapsed)));

    Ok((artifact, serde_json::Value::Object(data)))
}

async fn fetch_direct(
    state: &AppState,
    request: &ControlRequest,
    handle: &TaskHandle,
    url: &str,
    url_file_name: &str,
    scratch: &mut ScratchFiles,
    data: &mut serde_json::Map<String, serde_json::Value>,
) -> SmasherResult<PathBuf> {
    let file_name = match request.params.output_name.as_deref() {
        Some(name) if !name.trim().is_empty() => sanitize_title(name),
        _ => url_file_name.to_string(),
    };
    let dir = task_dir(&state.config.download_dir, handle);
    let destination = dir.join(file_name);
    scratch.track_dir(&dir);
    scratch.track(&destination);

    let requested = request.params.parts.unwrap_or(state.config.download_parts);
    let parts = requested.clamp(1, MAX_PARTS);
    if parts != requested {
        debug!("Requested {} part(s), using {}", requested, parts);
    }
    let (tx, rx) = mpsc::channel(16);
    let (result, ()) = tokio::join!(
        state.downloader.download(url, &destination, parts, handle.token(), Some(tx)),
        forward_download(state, handle, rx),
    );
    let report = result?;

    data.insert(
        "download".to_string(),
        json!({
            "url": url,
            "bytes": report.total_bytes,
            "parts": report.parts,
            "elapsed_secs": round2(report.elapsed.as_secs_f64()),
        }),
    );
    Ok(report.path)
}

async fn fetch_extracted(
    state: &AppState,
    request: &ControlRequest,
    handle: &TaskHandle,
    url: &str,
    scratch: &mut ScratchFiles,
    data: &mut serde_json::Map<String, serde_json::Value>,
) -> SmasherResult<PathBuf> {
    let info = state.extractor.list_encodings(url, handle.token()).await?;
    let encoding_id = request
        .params
        .encoding_id
        .clone()
        .unwrap_or_else(|| DEFAULT_ENCODING.to_string());

    let stem = match request.params.output_name.as_deref() {
        Some(name) if !name.trim().is_empty() => sanitize_title(name),
        _ => sanitize_title(&info.title),
    };
    let file_name = if stem.ends_with(".mp4") { stem } else { format!("{}.mp4", stem) };
    let dir = task_dir(&state.config.download_dir, handle);
    let output = dir.join(file_name);
    scratch.track_dir(&dir);
    scratch.track(&output);

    let (tx, rx) = mpsc::channel(16);
    let (result, ()) = tokio::join!(
        state.extractor.fetch(url, &encoding_id, &output, handle.token(), Some(tx)),
        forward_extraction(state, handle, rx),
    );
    let path = result?;

    data.insert(
        "source".to_string(),
        json!({ "url": url, "title": info.title, "encoding_id": encoding_id }),
    );
    Ok(path)
}

async fn transcode(
    state: &AppState,
    request: &ControlRequest,
    handle: &TaskHandle,
    source: &Path,
    scratch: &mut ScratchFiles,
) -> SmasherResult<TranscodeReport> {
    handle.set_kind(TaskKind::Transcode);

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
    let dir = task_dir(&state.config.encode_dir, handle);
    let output = dir.join(compressed_name(&file_name));
    scratch.track_dir(&dir);
    scratch.track(&output);

    let codec_params = request
        .params
        .codec_params
        .clone()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.config.default_codec_params.clone());
    let mut job = TranscodeJob::new(source.to_path_buf(), output, codec_params);

    let (tx, rx) = mpsc::channel(16);
    let (result, ()) = tokio::join!(
        state.transcoder.run(&mut job, handle.token(), Some(tx)),
        forward_transcode(state, handle, rx),
    );
    debug!("Transcode job {} ended {}", job.id, job.status());
    Ok(result?)
}

// ====== PROGRESS FORWARDING ======

/// Throttled progress publisher for one task phase.
struct ProgressPublisher<'a> {
    state: &'a AppState,
    handle: &'a TaskHandle,
    phase: Phase,
    throttle: ProgressThrottle,
}

impl<'a> ProgressPublisher<'a> {
    fn new(state: &'a AppState, handle: &'a TaskHandle, phase: Phase) -> Self {
        Self {
            state,
            handle,
            phase,
            throttle: ProgressThrottle::new(state.config.progress_interval),
        }
    }

    fn publish(&mut self, snapshot: &ProgressSnapshot, status: Option<&str>) {
        self.handle.update_progress(snapshot.percent);
        // The closing sample always goes out.
        if !self.throttle.ready() && snapshot.percent < 100.0 {
            return;
        }
        let mut event = progress_event(self.handle.key(), self.handle.task_id(), self.phase, snapshot);
        if let (Some(status), Some(data)) = (status, event.data.as_object_mut()) {
            data.insert("status".to_string(), json!(status));
        }
        self.state.emit(event);
    }
}

async fn forward_download(state: &AppState, handle: &TaskHandle, mut rx: mpsc::Receiver<ProgressSnapshot>) {
    let mut publisher = ProgressPublisher::new(state, handle, Phase::Downloading);
    while let Some(snapshot) = rx.recv().await {
        publisher.publish(&snapshot, None);
    }
}

async fn forward_extraction(state: &AppState, handle: &TaskHandle, mut rx: mpsc::Receiver<ExtractionProgress>) {
    let mut publisher = ProgressPublisher::new(state, handle, Phase::Extracting);
    let started = Instant::now();
    while let Some(update) = rx.recv().await {
        let mut snapshot = state.meter.render(
            update.downloaded_bytes as f64,
            update.total_bytes as f64,
            started.elapsed(),
        );
        // The extractor measures its own rate and remaining time.
        snapshot.speed = update.speed;
        snapshot.eta_secs = update.eta;
        publisher.publish(&snapshot, Some(&update.status));
    }
}

async fn forward_transcode(state: &AppState, handle: &TaskHandle, mut rx: mpsc::Receiver<TranscodeEvent>) {
    let mut publisher = ProgressPublisher::new(state, handle, Phase::Transcoding);
    while let Some(event) = rx.recv().await {
        match event {
            TranscodeEvent::DurationUnknown => state.emit(message_event(
                handle.key(),
                Some(handle.task_id()),
                EventKind::Warning,
                "Input duration unknown; progress shows processed time only.",
            )),
            TranscodeEvent::Progress { media_secs, snapshot } => {
                debug!("{} of media processed", format_time(media_secs));
                publisher.publish(&snapshot, None);
            }
        }
    }
}

// ====== QUERIES ======

async fn list_formats(state: Arc<AppState>, request: ControlRequest) {
    let requester = request.requester.as_str();
    let Some(url) = request.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        state.emit(message_event(requester, None, EventKind::Rejected, "formats requires a url"));
        return;
    };

    match state.extractor.list_encodings(url, &CancellationToken::new()).await {
        Ok(info) => state.emit(formats_event(requester, url, &info)),
        Err(e) if e.is_cancelled() => {
            info!("Format listing for {} cancelled", requester);
            state.emit(message_event(requester, None, EventKind::Cancelled, "Format listing cancelled."));
        }
        Err(e) => {
            warn!("Format listing for {} failed: {}", url, e);
            state.emit(message_event(requester, None, EventKind::Error, e.to_string()));
        }
    }
}

fn formats_event(requester: &str, url: &str, info: &MediaInfo) -> ControlEvent {
    let encodings: Vec<serde_json::Value> = info
        .encodings
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "label": e.label(),
                "container": e.container,
                "height": e.height,
                "frame_rate": e.frame_rate,
                "size": e.size,
                "size_human": format_size(e.size as f64),
            })
        })
        .collect();
    ControlEvent::new(requester, EventKind::Formats).with_data(json!({
        "url": url,
        "title": info.title,
        "encodings": encodings,
    }))
}

fn status_event(state: &AppState, requester: &str) -> ControlEvent {
    ControlEvent::new(requester, EventKind::Status).with_data(json!({
        "task": state.registry.get(requester),
        "active_tasks": state.registry.list(),
        "processes": state.processes.list(),
        "process_capacity": state.processes.capacity(),
    }))
}

// ====== FILES ======

/// Per-requester, per-task directory: `<base>/<requester>/<task_id>`.
fn task_dir(base: &Path, handle: &TaskHandle) -> PathBuf {
    base.join(sanitize_title(handle.key())).join(handle.task_id())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Files and directories a task created; removed on drop unless kept.
#[derive(Default)]
struct ScratchFiles {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl ScratchFiles {
    fn track(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    fn track_dir(&mut self, dir: &Path) {
        self.dirs.push(dir.to_path_buf());
    }

    /// Hand `path` over to the requester; it survives the task.
    fn keep(&mut self, path: &Path) {
        self.files.retain(|p| p != path);
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        clean_files(&self.files);
        // Only empty directories go; a kept artifact keeps its directory.
        for dir in self.dirs.iter().rev() {
            if std::fs::remove_dir(dir).is_ok() {
                debug!("Removed empty directory {}", dir.display());
            }
        }
    }
}

/// Delete each file, logging the outcome. Directories are skipped.
pub fn clean_files(paths: &[PathBuf]) {
    for path in paths {
        if path.is_dir() {
            debug!("Skipping directory {}", path.display());
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => info!("Deleted {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} already gone", path.display())
            }
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
}
