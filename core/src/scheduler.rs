use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cancel::StopSignal;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::queue::{QueueItem, TaskQueue};
use crate::task::TaskId;

const NETWORK_POLL: Duration = Duration::from_secs(1);

/// Runs the engine's `execute` entry point on the engine's behalf.
///
/// `enqueue` is unique per task id: enqueueing an id that is already queued
/// or running does nothing. `cancel` is best effort and cooperative.
pub trait SchedulerAdapter: Send + Sync {
    fn enqueue(&self, task_id: &str) -> CoreResult<()>;
    fn cancel(&self, task_id: &str);
}

pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task_id: &str, stop: &StopSignal) -> CoreResult<()>;
}

/// Connectivity constraint: nothing is dispatched while this reports false.
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    /// Total runs per enqueue, the first one included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_backoff: Duration::from_secs(config.retry_initial_backoff_secs),
            max_attempts: config.retry_max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << shift)
    }
}

#[derive(Debug)]
struct Entry {
    stop: StopSignal,
    running: bool,
    /// Enqueued again while a cancelled run was still winding down.
    requeue: bool,
}

#[derive(Debug, Default)]
struct State {
    queue: TaskQueue,
    entries: HashMap<TaskId, Entry>,
    running: usize,
    seq: u64,
    shutdown: bool,
}

impl State {
    fn push(&mut self, task_id: &str, attempt: u32, due: Instant) {
        self.seq += 1;
        let seq = self.seq;
        self.queue
            .push(QueueItem::new(task_id.to_string(), attempt, due, seq));
        self.entries.insert(
            task_id.to_string(),
            Entry {
                stop: StopSignal::new(),
                running: false,
                requeue: false,
            },
        );
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running == 0
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    executor: Mutex<Option<Weak<dyn TaskExecutor>>>,
    network: Box<dyn NetworkMonitor>,
    policy: RetryPolicy,
    max_active: usize,
}

impl Shared {
    fn lock(&self) -> CoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CoreError::InvalidState("scheduler lock poisoned".to_string()))
    }

    fn can_start(&self, active_count: usize) -> bool {
        active_count < self.max_active
    }
}

/// In-process scheduler: a dispatcher thread pops due work from a
/// [`TaskQueue`], runs each task on its own thread while fewer than
/// `max_concurrent_tasks` are active and the network is up, and re-queues
/// retryable failures with exponential back-off.
pub struct WorkScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_network(config, Box::new(AlwaysOnline))
    }

    pub fn with_network(config: &EngineConfig, network: Box<dyn NetworkMonitor>) -> Self {
        Self::with_policy(
            RetryPolicy::from_config(config),
            config.max_concurrent_tasks.max(1),
            network,
        )
    }

    pub fn with_policy(policy: RetryPolicy, max_active: usize, network: Box<dyn NetworkMonitor>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            executor: Mutex::new(None),
            network,
            policy,
            max_active: max_active.max(1),
        });
        let worker = Arc::clone(&shared);
        let dispatcher = thread::spawn(move || dispatch_loop(worker));
        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Attaches the executor. Held weakly so the engine can own the scheduler.
    pub fn bind(&self, executor: Weak<dyn TaskExecutor>) {
        if let Ok(mut slot) = self.shared.executor.lock() {
            *slot = Some(executor);
        }
        self.shared.wake.notify_all();
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.shared
            .lock()
            .map(|state| state.entries.contains_key(task_id))
            .unwrap_or(false)
    }

    /// Blocks until nothing is queued or running, or `timeout` passes.
    /// Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.shared.lock() else {
            return false;
        };
        while !state.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.wake.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }

    /// Stops dispatching and cancels every running task.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.shared.lock() {
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            for entry in state.entries.values().filter(|e| e.running) {
                entry.stop.cancel();
            }
        }
        self.shared.wake.notify_all();
        let handle = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }
}

impl Drop for WorkScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedulerAdapter for WorkScheduler {
    fn enqueue(&self, task_id: &str) -> CoreResult<()> {
        let mut state = self.shared.lock()?;
        if state.shutdown {
            return Err(CoreError::InvalidState("scheduler is shut down".to_string()));
        }
        if let Some(entry) = state.entries.get_mut(task_id) {
            if entry.running && entry.stop.is_cancelled() {
                entry.requeue = true;
            }
            debug!(task_id, "already scheduled");
            return Ok(());
        }
        state.push(task_id, 0, Instant::now());
        drop(state);
        debug!(task_id, "enqueued");
        self.shared.wake.notify_all();
        Ok(())
    }

    fn cancel(&self, task_id: &str) {
        let Ok(mut state) = self.shared.lock() else {
            return;
        };
        let running = match state.entries.get_mut(task_id) {
            Some(entry) if entry.running => {
                entry.stop.cancel();
                entry.requeue = false;
                true
            }
            Some(_) => false,
            None => return,
        };
        if !running {
            state.entries.remove(task_id);
            state.queue.remove(task_id);
        }
        drop(state);
        debug!(task_id, running, "cancel requested");
        self.shared.wake.notify_all();
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let (item, stop) = {
            let Ok(mut state) = shared.lock() else {
                return;
            };
            let item = loop {
                if state.shutdown {
                    return;
                }
                let online = shared.network.is_connected();
                if online && shared.can_start(state.running) {
                    if let Some(item) = state.queue.pop_due(Instant::now()) {
                        break item;
                    }
                }
                let wait = if !online {
                    Some(NETWORK_POLL)
                } else {
                    state
                        .queue
                        .next_due()
                        .map(|due| due.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)))
                };
                state = match wait {
                    Some(timeout) => match shared.wake.wait_timeout(state, timeout) {
                        Ok((guard, _)) => guard,
                        Err(_) => return,
                    },
                    None => match shared.wake.wait(state) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    },
                };
            };
            let Some(entry) = state.entries.get_mut(&item.task_id) else {
                continue;
            };
            entry.running = true;
            let stop = entry.stop.clone();
            state.running += 1;
            (item, stop)
        };

        let worker = Arc::clone(&shared);
        thread::spawn(move || run_item(worker, item, stop));
    }
}

fn run_item(shared: Arc<Shared>, item: QueueItem, stop: StopSignal) {
    let executor = shared
        .executor
        .lock()
        .ok()
        .and_then(|slot| slot.as_ref().and_then(Weak::upgrade));
    let result = match executor {
        Some(executor) => {
            debug!(task_id = %item.task_id, attempt = item.attempt, "executing");
            panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&item.task_id, &stop)))
                .unwrap_or_else(|payload| Err(CoreError::from_panic(payload.as_ref())))
        }
        None => Err(CoreError::InvalidState("no executor bound".to_string())),
    };
    finish(&shared, &item, result);
}

fn finish(shared: &Shared, item: &QueueItem, result: CoreResult<()>) {
    let task_id = item.task_id.as_str();
    if let Ok(mut state) = shared.lock() {
        state.running = state.running.saturating_sub(1);
        let entry = state.entries.remove(task_id);
        let was_cancelled = entry.as_ref().map(|e| e.stop.is_cancelled()).unwrap_or(true);
        let requeue = entry.map(|e| e.requeue).unwrap_or(false);

        match &result {
            Ok(()) => info!(task_id, "task finished"),
            Err(err) if err.is_cancelled() || was_cancelled => {
                debug!(task_id, "task stopped by cancellation")
            }
            Err(err) if err.is_retryable() && item.attempt + 1 < shared.policy.max_attempts => {
                let attempt = item.attempt + 1;
                let delay = shared.policy.delay_for(attempt);
                warn!(task_id, attempt, delay_secs = delay.as_secs_f64(), error = %err, "retrying after back-off");
                if !state.shutdown {
                    state.push(task_id, attempt, Instant::now() + delay);
                }
            }
            Err(err) => error!(task_id, attempt = item.attempt, error = %err, "task gave up"),
        }

        if requeue && !state.shutdown && !state.entries.contains_key(task_id) {
            state.push(task_id, 0, Instant::now());
        }
    }
    shared.wake.notify_all();
}
