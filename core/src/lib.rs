pub mod cancel;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
mod fsutil;
pub mod mux;
pub mod net;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod segment;
pub mod storage;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;


pub use crate::cancel::StopSignal;
pub use crate::config::EngineConfig;
pub use crate::engine::DownloadEngine;
pub use crate::error::{CoreError, CoreResult};
pub use crate::mux::{MuxEngine, MuxOutcome};
pub use crate::net::{CredentialProvider, NetClient, ReqwestNetClient, StaticCredentials};
pub use crate::scheduler::{SchedulerAdapter, TaskExecutor, WorkScheduler};
pub use crate::storage::{JsonFileStorage, MemoryStorage, Storage};
pub use crate::store::StoreEvent;
pub use crate::task::{DownloadTask, TaskId, TaskRequest, TaskStatus};
