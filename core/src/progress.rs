use std::sync::mpsc::Sender;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Completed fraction of the stream, `0.0..=1.0`.
    pub fraction: f64,
    pub downloaded: u64,
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Forwards every event into a channel so callers can consume progress as a
/// sequence.
pub struct ChannelObserver {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

struct AccumulatorState {
    per_segment: Vec<u64>,
    last_fraction: Option<f64>,
}

/// Shared byte counter for concurrently running segment fetchers.
///
/// The lock is held across the sum and the observer call so events leave in
/// the order the sums were computed; an unchanged fraction is not re-emitted.
pub(crate) struct ProgressAccumulator<'a> {
    total: u64,
    state: Mutex<AccumulatorState>,
    observer: &'a dyn ProgressObserver,
}

impl<'a> ProgressAccumulator<'a> {
    pub(crate) fn new(total: u64, segments: usize, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            total,
            state: Mutex::new(AccumulatorState {
                per_segment: vec![0; segments],
                last_fraction: None,
            }),
            observer,
        }
    }

    pub(crate) fn report(&self, index: usize, cumulative: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(slot) = state.per_segment.get_mut(index) {
            *slot = cumulative;
        }
        let downloaded: u64 = state.per_segment.iter().sum();
        let fraction = fraction_of(downloaded, self.total);
        if state.last_fraction == Some(fraction) {
            return;
        }
        state.last_fraction = Some(fraction);
        self.observer.on_progress(ProgressEvent {
            fraction,
            downloaded,
        });
    }
}

pub(crate) fn fraction_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}
