use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cancel::StopSignal;
use crate::config::EngineConfig;
use crate::downloader::{SegmentedDownloader, StreamTarget};
use crate::error::{CoreError, CoreResult};
use crate::fsutil::remove_quietly;
use crate::mux::{MuxEngine, MuxOutcome};
use crate::net::{CredentialProvider, DownloadRequest, NetClient, ReqwestNetClient, StaticCredentials};
use crate::progress::{ProgressEvent, ProgressObserver};
use crate::scheduler::{SchedulerAdapter, TaskExecutor, WorkScheduler};
use crate::segment::copy_body;
use crate::storage::Storage;
use crate::store::{StoreEvent, TaskStore};
use crate::task::{DownloadTask, TaskId, TaskRequest, TaskStatus};

/// Owns the task state machine and drives download, mux and persistence for
/// every task. Constructed once and shared behind an `Arc`.
pub struct DownloadEngine {
    config: EngineConfig,
    store: TaskStore,
    net: Arc<dyn NetClient>,
    credentials: Arc<dyn CredentialProvider>,
    scheduler: Arc<dyn SchedulerAdapter>,
    mux: MuxEngine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Video,
    Audio,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Video => "video",
            Stream::Audio => "audio",
        }
    }
}

/// On-disk names for one task.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub video_segments: PathBuf,
    pub audio_segments: PathBuf,
    pub output: PathBuf,
}

impl TaskPaths {
    pub fn new(work_dir: &Path, dest_dir: &Path, task_id: &str) -> Self {
        Self {
            video: work_dir.join(format!("{}_video.tmp", task_id)),
            audio: work_dir.join(format!("{}_audio.tmp", task_id)),
            video_segments: work_dir.join(format!("{}_video", task_id)),
            audio_segments: work_dir.join(format!("{}_audio", task_id)),
            output: dest_dir.join(format!("{}.mp4", task_id)),
        }
    }

    fn remove_temps(&self) {
        remove_quietly(&self.video);
        remove_quietly(&self.audio);
    }
}

impl DownloadEngine {
    pub fn new(
        config: EngineConfig,
        storage: Box<dyn Storage>,
        scheduler: Arc<dyn SchedulerAdapter>,
    ) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(&config.user_agent, config.connect_timeout_secs)?;
        Ok(Self {
            config,
            store: TaskStore::open(storage),
            net: Arc::new(net),
            credentials: Arc::new(StaticCredentials::default()),
            scheduler,
            mux: MuxEngine::new(),
        })
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = net;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Shares the engine and registers it as the executor behind `scheduler`.
    pub fn bind_to(self, scheduler: &WorkScheduler) -> Arc<Self> {
        let engine = Arc::new(self);
        let executor: Weak<dyn TaskExecutor> = Arc::downgrade(&engine) as Weak<dyn TaskExecutor>;
        scheduler.bind(executor);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths_for(&self, task: &DownloadTask) -> TaskPaths {
        TaskPaths::new(&self.config.work_dir, &self.dest_dir(task), &task.id)
    }

    fn dest_dir(&self, task: &DownloadTask) -> PathBuf {
        task.custom_save_dir
            .as_ref()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.download_dir.clone())
    }

    pub fn add_task(&self, request: TaskRequest) -> CoreResult<TaskId> {
        if request.content_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("content id is empty".to_string()));
        }
        for (name, value) in [("video", &request.video_url), ("audio", &request.audio_url)] {
            Url::parse(value)
                .map_err(|err| CoreError::InvalidRequest(format!("{} url {:?}: {}", name, value, err)))?;
        }

        let task = DownloadTask::new(request);
        let id = task.id.clone();
        let inserted = self.store.insert_unless(task, |existing| existing.is_downloading())?;
        if !inserted {
            return Err(CoreError::Duplicate(id));
        }
        info!(task_id = %id, "task added");
        self.scheduler.enqueue(&id)?;
        Ok(id)
    }

    pub fn start(&self, id: &str) -> CoreResult<()> {
        let task = self.store.get(id)?;
        match task.status {
            TaskStatus::Downloading | TaskStatus::Merging => {
                debug!(task_id = id, "start ignored, already running");
                return Ok(());
            }
            TaskStatus::Completed => {
                return Err(CoreError::InvalidState(format!(
                    "cannot start task in state {}",
                    task.status
                )))
            }
            TaskStatus::Paused | TaskStatus::Failed => {
                self.store.update(id, |t| t.transition(TaskStatus::Pending))?;
            }
            TaskStatus::Pending => {}
        }
        info!(task_id = id, "task scheduled");
        self.scheduler.enqueue(id)
    }

    pub fn pause(&self, id: &str) -> CoreResult<()> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::Downloading {
            return Err(CoreError::InvalidState(format!(
                "cannot pause task in state {}",
                task.status
            )));
        }
        self.scheduler.cancel(id);
        let updated = self
            .store
            .update(id, |t| t.transition(TaskStatus::Paused))?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if updated.status != TaskStatus::Paused {
            return Err(CoreError::InvalidState(format!(
                "task moved to {} before it could be paused",
                updated.status
            )));
        }
        info!(task_id = id, "task paused");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> CoreResult<()> {
        self.scheduler.cancel(id);
        let task = self
            .store
            .remove(id)?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        let paths = self.paths_for(&task);
        paths.remove_temps();
        remove_quietly(&paths.output);
        self.remove_segment_files(id);
        if let Some(cover) = &task.local_cover_path {
            remove_quietly(Path::new(cover));
        }
        info!(task_id = id, "task removed");
        Ok(())
    }

    fn remove_segment_files(&self, id: &str) {
        let prefixes = [format!("{}_video_seg", id), format!("{}_audio_seg", id)];
        let Ok(entries) = fs::read_dir(&self.config.work_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") && prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                remove_quietly(&entry.path());
            }
        }
    }

    pub fn get_task(&self, id: &str) -> CoreResult<DownloadTask> {
        self.store.get(id)
    }

    pub fn list_tasks(&self) -> CoreResult<Vec<DownloadTask>> {
        self.store.list()
    }

    pub fn find_task(&self, content_id: &str, variant_id: i64) -> CoreResult<Option<DownloadTask>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .find(|t| t.content_id == content_id && t.variant_id == variant_id))
    }

    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Resets tasks left DOWNLOADING/MERGING by a previous process to PENDING
    /// and schedules every pending task. Returns how many were scheduled.
    pub fn recover_interrupted(&self) -> CoreResult<usize> {
        let mut scheduled = 0usize;
        for task in self.store.list()? {
            if task.is_downloading() {
                self.store.update(&task.id, |t| {
                    t.status = TaskStatus::Pending;
                    t.error_message = None;
                    t.file_path = None;
                    t.reset_progress();
                    true
                })?;
                info!(task_id = %task.id, previous = %task.status, "recovered interrupted task");
            } else if task.status != TaskStatus::Pending {
                continue;
            }
            self.scheduler.enqueue(&task.id)?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    fn begin(&self, id: &str) -> CoreResult<DownloadTask> {
        let mut previous = None;
        let task = self
            .store
            .update(id, |t| {
                previous = Some(t.status);
                if t.status == TaskStatus::Failed {
                    t.transition(TaskStatus::Pending);
                }
                if t.status != TaskStatus::Pending {
                    return false;
                }
                t.reset_progress();
                t.transition(TaskStatus::Downloading)
            })?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Downloading {
            return Err(CoreError::InvalidState(format!(
                "cannot execute task in state {}",
                previous.unwrap_or(task.status)
            )));
        }
        Ok(task)
    }

    fn run_pipeline(&self, task: &DownloadTask, paths: &TaskPaths, stop: &StopSignal) -> CoreResult<MuxOutcome> {
        fs::create_dir_all(&self.config.work_dir)?;
        if let Some(parent) = paths.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let downloader =
            SegmentedDownloader::new(self.net.as_ref(), &self.config).with_headers(self.credentials.headers());

        let mut downloaded = 0u64;
        for (stream, url, dest, prefix) in [
            (Stream::Video, &task.video_url, &paths.video, &paths.video_segments),
            (Stream::Audio, &task.audio_url, &paths.audio, &paths.audio_segments),
        ] {
            info!(task_id = %task.id, stream = stream.as_str(), "downloading stream");
            let observer = StreamProgress::new(&self.store, &task.id, stream, downloaded, self.config.progress_step);
            let bytes = downloader.download(
                StreamTarget {
                    url,
                    dest,
                    segment_prefix: prefix,
                },
                stop,
                &observer,
            )?;
            downloaded += bytes;
            observer.finish(downloaded)?;
        }

        let merging = self
            .store
            .update(&task.id, |t| t.transition(TaskStatus::Merging))?
            .ok_or_else(|| CoreError::NotFound(task.id.clone()))?;
        if merging.status != TaskStatus::Merging {
            // paused between the last segment and the state change
            return Err(CoreError::Cancelled);
        }
        info!(task_id = %task.id, bytes = downloaded, "merging streams");
        self.mux.merge(&paths.video, &paths.audio, &paths.output)
    }

    fn complete(&self, task: &DownloadTask, paths: &TaskPaths, outcome: &MuxOutcome) -> CoreResult<()> {
        let file_size = fs::metadata(&paths.output)?.len();
        let file_path = paths.output.to_string_lossy().to_string();
        let updated = self.store.update(&task.id, |t| {
            if !t.transition(TaskStatus::Completed) {
                return false;
            }
            t.file_path = Some(file_path.clone());
            t.file_size = file_size;
            true
        })?;
        let Some(updated) = updated else {
            info!(task_id = %task.id, "task removed while running, discarding output");
            remove_quietly(&paths.output);
            return Ok(());
        };
        if updated.status != TaskStatus::Completed {
            warn!(task_id = %task.id, status = %updated.status, "task left running state before completion");
            return Ok(());
        }
        info!(
            task_id = %task.id,
            file_size,
            degraded = outcome.is_degraded(),
            path = %file_path,
            "task completed"
        );

        let dest_dir = paths.output.parent().map(Path::to_path_buf).unwrap_or_default();
        if let Some(cover) = self.cache_cover(&updated, &dest_dir) {
            self.store.update(&task.id, |t| {
                t.local_cover_path = Some(cover);
                true
            })?;
        }
        Ok(())
    }

    /// Best effort; failures are logged and yield `None`.
    fn cache_cover(&self, task: &DownloadTask, dest_dir: &Path) -> Option<String> {
        let url = Url::parse(&task.cover).ok()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }
        let ext = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "jpg".to_string());
        let dest = dest_dir.join(format!("{}_cover.{}", task.id, ext));

        let mut req = DownloadRequest::new(task.cover.clone());
        req.headers = self.config.default_headers.clone();
        req.headers.extend(self.credentials.headers());
        let result = self.net.get(&req).and_then(|mut resp| {
            if !resp.is_success() {
                return Err(CoreError::Transfer(format!("HTTP {}", resp.status_code)));
            }
            copy_body(
                resp.body.as_mut(),
                &dest,
                self.config.buffer_size,
                &StopSignal::new(),
                &mut |_| {},
            )
        });
        match result {
            Ok(bytes) => {
                debug!(task_id = %task.id, bytes, "cover cached");
                Some(dest.to_string_lossy().to_string())
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "cover cache failed");
                remove_quietly(&dest);
                None
            }
        }
    }
}

impl TaskExecutor for DownloadEngine {
    fn execute(&self, id: &str, stop: &StopSignal) -> CoreResult<()> {
        let task = self.begin(id)?;
        let paths = self.paths_for(&task);
        info!(task_id = id, "task started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_pipeline(&task, &paths, stop).and_then(|outcome| {
                paths.remove_temps();
                self.complete(&task, &paths, &outcome)
            })
        }))
        .unwrap_or_else(|payload| Err(CoreError::from_panic(payload.as_ref())));

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        paths.remove_temps();
        remove_quietly(&paths.output);

        if err.is_cancelled() {
            self.store
                .update(id, |t| t.transition(TaskStatus::Paused))?;
            info!(task_id = id, "task stopped, temp files removed");
            return Err(CoreError::Cancelled);
        }

        let message = err.to_string();
        self.store.update(id, |t| {
            if !t.transition(TaskStatus::Failed) {
                return false;
            }
            t.error_message = Some(message.clone());
            true
        })?;
        error!(task_id = id, retryable = err.is_retryable(), error = %err, "task failed");
        Err(err)
    }
}

/// Writes per-stream progress back to the store whenever it advances by at
/// least `step`, and on completion.
struct StreamProgress<'a> {
    store: &'a TaskStore,
    task_id: &'a str,
    stream: Stream,
    base_bytes: u64,
    step: f32,
    last: Mutex<f32>,
}

impl<'a> StreamProgress<'a> {
    fn new(store: &'a TaskStore, task_id: &'a str, stream: Stream, base_bytes: u64, step: f32) -> Self {
        Self {
            store,
            task_id,
            stream,
            base_bytes,
            step,
            last: Mutex::new(0.0),
        }
    }

    fn write(&self, fraction: f32, downloaded_bytes: u64) -> CoreResult<()> {
        let stream = self.stream;
        self.store.update(self.task_id, |t| {
            if t.status != TaskStatus::Downloading {
                return false;
            }
            match stream {
                Stream::Video => t.set_video_progress(fraction),
                Stream::Audio => t.set_audio_progress(fraction),
            }
            t.downloaded_bytes = downloaded_bytes;
            true
        })?;
        Ok(())
    }

    fn finish(&self, downloaded_bytes: u64) -> CoreResult<()> {
        self.write(1.0, downloaded_bytes)
    }
}

impl ProgressObserver for StreamProgress<'_> {
    fn on_progress(&self, event: ProgressEvent) {
        let fraction = event.fraction as f32;
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        let done = fraction >= 1.0 && *last < 1.0;
        if fraction - *last < self.step && !done {
            return;
        }
        *last = fraction;
        trace!(task_id = self.task_id, stream = self.stream.as_str(), fraction, "progress");
        if let Err(err) = self.write(fraction, self.base_bytes + event.downloaded) {
            debug!(task_id = self.task_id, error = %err, "progress update dropped");
        }
    }
}
