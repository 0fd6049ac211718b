use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

const STOP_NONE: u8 = 0;
const STOP_CANCELED: u8 = 1;
const STOP_FAILED: u8 = 2;

/// Cooperative stop flag shared between a scheduler invocation and every
/// fetcher loop underneath it. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicU8>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _ = self.flag.compare_exchange(
            STOP_NONE,
            STOP_CANCELED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Marks a sibling failure. Cancellation already in effect takes
    /// precedence.
    pub(crate) fn abort(&self) {
        let _ = self.flag.compare_exchange(
            STOP_NONE,
            STOP_FAILED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == STOP_CANCELED
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst) != STOP_NONE
    }

    /// Child flag for one downloader call: a sibling failure stops the
    /// siblings without cancelling the parent invocation.
    pub(crate) fn child(&self) -> ChildStop<'_> {
        ChildStop {
            parent: self,
            local: StopSignal::new(),
        }
    }

    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub(crate) struct ChildStop<'a> {
    parent: &'a StopSignal,
    local: StopSignal,
}

impl ChildStop<'_> {
    pub(crate) fn abort(&self) {
        self.local.abort();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.parent.is_cancelled()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.parent.is_stopped() || self.local.is_stopped()
    }
}
