use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::storage::Storage;
use crate::task::{DownloadTask, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Updated(DownloadTask),
    Removed(TaskId),
}

/// In-memory task map backed by a [`Storage`] snapshot.
///
/// Every mutation swaps a whole task value under the map lock and then
/// persists the full map, so readers only ever see complete tasks. Persistence
/// failures are logged and never block the in-memory state.
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, DownloadTask>>,
    storage: Mutex<Box<dyn Storage>>,
    subscribers: Mutex<Vec<Sender<StoreEvent>>>,
}

impl TaskStore {
    pub fn open(storage: Box<dyn Storage>) -> Self {
        let tasks = match storage.load_all() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "failed to load task snapshot, starting empty");
                Vec::new()
            }
        };
        debug!(count = tasks.len(), "loaded task snapshot");
        let tasks = tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        Self {
            tasks: Mutex::new(tasks),
            storage: Mutex::new(storage),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, id: &str) -> CoreResult<DownloadTask> {
        self.lock_tasks()?
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> CoreResult<Vec<DownloadTask>> {
        let mut tasks: Vec<DownloadTask> = self.lock_tasks()?.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Inserts `task` unless `reject` says the current record must be kept.
    /// The check and the write happen under one lock.
    pub fn insert_unless<F>(&self, task: DownloadTask, reject: F) -> CoreResult<bool>
    where
        F: FnOnce(&DownloadTask) -> bool,
    {
        let mut tasks = self.lock_tasks()?;
        if let Some(existing) = tasks.get(&task.id) {
            if reject(existing) {
                return Ok(false);
            }
        }
        tasks.insert(task.id.clone(), task.clone());
        self.persist(&tasks);
        drop(tasks);
        self.publish(StoreEvent::Updated(task));
        Ok(true)
    }

    /// Applies `f` to a copy of the task and swaps the result in. Returns the
    /// new value, or `None` when the task no longer exists. `f` may return
    /// `false` to leave the stored value untouched.
    pub fn update<F>(&self, id: &str, f: F) -> CoreResult<Option<DownloadTask>>
    where
        F: FnOnce(&mut DownloadTask) -> bool,
    {
        let mut tasks = self.lock_tasks()?;
        let Some(current) = tasks.get(id) else {
            return Ok(None);
        };
        let mut next = current.clone();
        if !f(&mut next) {
            return Ok(Some(current.clone()));
        }
        tasks.insert(id.to_string(), next.clone());
        self.persist(&tasks);
        drop(tasks);
        self.publish(StoreEvent::Updated(next.clone()));
        Ok(Some(next))
    }

    pub fn remove(&self, id: &str) -> CoreResult<Option<DownloadTask>> {
        let mut tasks = self.lock_tasks()?;
        let removed = tasks.remove(id);
        if removed.is_some() {
            self.persist(&tasks);
        }
        drop(tasks);
        if removed.is_some() {
            self.publish(StoreEvent::Removed(id.to_string()));
        }
        Ok(removed)
    }

    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn lock_tasks(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<TaskId, DownloadTask>>> {
        self.tasks
            .lock()
            .map_err(|_| CoreError::Persistence("task map lock poisoned".to_string()))
    }

    // Called with the map lock held so snapshots reach disk in mutation order.
    fn persist(&self, tasks: &HashMap<TaskId, DownloadTask>) {
        let mut snapshot: Vec<DownloadTask> = tasks.values().cloned().collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let result = match self.storage.lock() {
            Ok(mut storage) => storage.save_all(&snapshot),
            Err(_) => Err(CoreError::Persistence("storage lock poisoned".to_string())),
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to persist task snapshot");
        }
    }

    fn publish(&self, event: StoreEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
