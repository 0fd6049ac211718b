use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default destination for finished containers.
    pub download_dir: PathBuf,
    /// Elementary stream and segment temp files live here.
    pub work_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub segment_count: u32,
    /// Streams smaller than this are fetched whole.
    pub min_parallel_bytes: u64,
    pub buffer_size: usize,
    pub user_agent: String,
    pub default_headers: HashMap<String, String>,
    pub connect_timeout_secs: u64,
    pub max_concurrent_tasks: usize,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_attempts: u32,
    /// Minimum per-stream progress advance written back to the task store.
    pub progress_step: f32,
}

impl EngineConfig {
    pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            download_dir: base.join("downloads"),
            work_dir: base.join("downloads"),
            tasks_file: base.join("download_tasks.json"),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut default_headers = HashMap::new();
        default_headers.insert(
            "Referer".to_string(),
            "https://www.bilibili.com".to_string(),
        );
        Self {
            download_dir: PathBuf::from("downloads"),
            work_dir: PathBuf::from("downloads"),
            tasks_file: PathBuf::from("download_tasks.json"),
            segment_count: 4,
            min_parallel_bytes: 1024 * 1024,
            buffer_size: 64 * 1024,
            user_agent: "Mozilla/5.0".to_string(),
            default_headers,
            connect_timeout_secs: 15,
            max_concurrent_tasks: 3,
            retry_initial_backoff_secs: 30,
            retry_max_attempts: 5,
            progress_step: 0.01,
        }
    }
}
