use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Merging,
    Completed,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Merging => "merging",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
        }
    }

    /// Edges of the task state machine. Anything not listed here is rejected.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Merging)
                | (Downloading, Failed)
                | (Downloading, Paused)
                | (Merging, Completed)
                | (Merging, Failed)
                | (Paused, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a collaborator hands to `add_task`: the identity, what to show and
/// where to fetch from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub content_id: String,
    pub variant_id: i64,
    pub quality: i32,
    pub quality_desc: String,
    pub title: String,
    pub cover: String,
    pub owner_name: String,
    pub owner_face: String,
    pub duration_secs: u32,
    pub video_url: String,
    pub audio_url: String,
    pub custom_save_dir: Option<String>,
}

impl TaskRequest {
    pub fn task_id(&self) -> TaskId {
        task_key(&self.content_id, self.variant_id, self.quality)
    }
}

pub fn task_key(content_id: &str, variant_id: i64, quality: i32) -> TaskId {
    format!("{}_{}_{}", content_id, variant_id, quality)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    pub id: TaskId,
    pub content_id: String,
    pub variant_id: i64,
    pub title: String,
    pub cover: String,
    pub owner_name: String,
    pub owner_face: String,
    pub duration_secs: u32,
    pub quality: i32,
    pub quality_desc: String,
    pub video_url: String,
    pub audio_url: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub video_progress: f32,
    pub audio_progress: f32,
    pub downloaded_bytes: u64,
    pub file_size: u64,
    pub file_path: Option<String>,
    pub error_message: Option<String>,
    pub custom_save_dir: Option<String>,
    pub local_cover_path: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DownloadTask {
    pub fn new(request: TaskRequest) -> Self {
        let now = now_millis();
        Self {
            id: request.task_id(),
            content_id: request.content_id,
            variant_id: request.variant_id,
            title: request.title,
            cover: request.cover,
            owner_name: request.owner_name,
            owner_face: request.owner_face,
            duration_secs: request.duration_secs,
            quality: request.quality,
            quality_desc: request.quality_desc,
            video_url: request.video_url,
            audio_url: request.audio_url,
            status: TaskStatus::Pending,
            progress: 0.0,
            video_progress: 0.0,
            audio_progress: 0.0,
            downloaded_bytes: 0,
            file_size: 0,
            file_path: None,
            error_message: None,
            custom_save_dir: request.custom_save_dir,
            local_cover_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self.status, TaskStatus::Downloading | TaskStatus::Merging)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self.status, TaskStatus::Paused | TaskStatus::Failed)
    }

    /// Moves to `next`, keeping the output/error fields consistent with the
    /// new status. Returns false and leaves the task untouched on an illegal
    /// edge.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next != TaskStatus::Failed {
            self.error_message = None;
        }
        if next != TaskStatus::Completed {
            self.file_path = None;
        }
        self.touch();
        true
    }

    pub fn set_video_progress(&mut self, value: f32) {
        self.video_progress = clamp_unit(value);
        self.recompute_progress();
    }

    pub fn set_audio_progress(&mut self, value: f32) {
        self.audio_progress = clamp_unit(value);
        self.recompute_progress();
    }

    pub fn reset_progress(&mut self) {
        self.video_progress = 0.0;
        self.audio_progress = 0.0;
        self.downloaded_bytes = 0;
        self.recompute_progress();
    }

    fn recompute_progress(&mut self) {
        self.progress = clamp_unit((self.video_progress + self.audio_progress) / 2.0);
        self.touch();
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TaskRequest {
        TaskRequest {
            content_id: "BV1xx411c7mD".to_string(),
            variant_id: 27099,
            quality: 80,
            quality_desc: "1080P".to_string(),
            title: "demo".to_string(),
            video_url: "https://cdn.example.com/v.m4s".to_string(),
            audio_url: "https://cdn.example.com/a.m4s".to_string(),
            ..TaskRequest::default()
        }
    }

    #[test]
    fn id_is_composite_key() {
        let task = DownloadTask::new(request());
        assert_eq!(task.id, "BV1xx411c7mD_27099_80");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn state_machine_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Merging.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Downloading));
        assert!(!Merging.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn transition_keeps_output_fields_consistent() {
        let mut task = DownloadTask::new(request());
        assert!(task.transition(TaskStatus::Downloading));
        task.error_message = Some("boom".to_string());
        assert!(task.transition(TaskStatus::Failed));
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(task.transition(TaskStatus::Pending));
        assert!(task.error_message.is_none());
        assert!(!task.transition(TaskStatus::Completed));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn overall_progress_is_mean_and_clamped() {
        let mut task = DownloadTask::new(request());
        task.set_video_progress(1.0);
        assert_eq!(task.progress, 0.5);
        task.set_audio_progress(1.7);
        assert_eq!(task.audio_progress, 1.0);
        assert_eq!(task.progress, 1.0);
        task.set_video_progress(-0.2);
        assert_eq!(task.progress, 0.5);
    }

    #[test]
    fn predicates() {
        let mut task = DownloadTask::new(request());
        assert!(!task.is_downloading());
        task.status = TaskStatus::Merging;
        assert!(task.is_downloading());
        task.status = TaskStatus::Failed;
        assert!(task.can_resume());
        task.status = TaskStatus::Completed;
        assert!(task.is_complete());
    }
}
