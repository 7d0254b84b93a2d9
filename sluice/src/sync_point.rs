//! One-shot completion tokens shared between queues and the CPU.
use crate::{engine::Shared, error::DeviceLost, fence::Fence};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

static NEXT_SYNC_POINT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncPointKind {
    /// Only usable as a GPU-side dependency between payloads.
    GpuOnly,
    /// Can additionally be waited on by the CPU.
    GpuAndCpu,
}

pub type SyncPointRef = Arc<SyncPoint>;

/// A manual-reset event set by the interrupt engine.
#[derive(Default)]
pub(crate) struct CompletionEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl CompletionEvent {
    pub(crate) fn set(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.fired.lock()
    }

    /// Returns whether the event was set before the timeout expired.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock();
        while !*fired {
            if self.cond.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

/// The position in a queue's fence at which a sync point completes.
#[derive(Clone)]
pub(crate) struct Resolution {
    pub(crate) fence: Arc<Fence>,
    pub(crate) value: u64,
}

/// A one-shot token marking a point in a queue's timeline.
///
/// A sync point starts unresolved. When the payload signaling it is finalized, the submission
/// engine resolves it to a `(fence, value)` pair; payloads waiting on it cannot be submitted
/// before that. Sync points of kind [`SyncPointKind::GpuAndCpu`] also carry an event that the
/// interrupt engine sets once the fence reaches the value.
pub struct SyncPoint {
    id: u64,
    kind: SyncPointKind,
    name: Option<String>,
    resolution: OnceCell<Resolution>,
    event: Option<CompletionEvent>,
    engine: Weak<Shared>,
}

impl SyncPoint {
    pub(crate) fn new(kind: SyncPointKind, name: Option<String>, engine: Weak<Shared>) -> SyncPointRef {
        Arc::new(SyncPoint {
            id: NEXT_SYNC_POINT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name,
            resolution: OnceCell::new(),
            event: match kind {
                SyncPointKind::GpuOnly => None,
                SyncPointKind::GpuAndCpu => Some(CompletionEvent::default()),
            },
            engine,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SyncPointKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.get().is_some()
    }

    /// Name of the fence and value this sync point resolved to.
    pub fn resolved_value(&self) -> Option<(&str, u64)> {
        self.resolution.get().map(|r| (r.fence.name(), r.value))
    }

    pub(crate) fn resolution(&self) -> Option<&Resolution> {
        self.resolution.get()
    }

    /// Panics if the sync point was already resolved.
    pub(crate) fn resolve(&self, fence: &Arc<Fence>, value: u64) {
        let resolution = Resolution {
            fence: fence.clone(),
            value,
        };
        if self.resolution.set(resolution).is_err() {
            panic!("sync point {} resolved twice", self.id);
        }
    }

    /// Called by the interrupt engine once the resolved value has been reached.
    pub(crate) fn complete(&self) {
        if let Some(event) = &self.event {
            event.set();
        }
    }

    pub(crate) fn event(&self) -> &CompletionEvent {
        match &self.event {
            Some(event) => event,
            None => panic!("sync point {} is GPU-only and cannot be observed by the CPU", self.id),
        }
    }

    /// Returns whether the GPU has reached this sync point.
    ///
    /// Panics if the sync point is [`SyncPointKind::GpuOnly`].
    pub fn is_complete(&self) -> bool {
        let event = self.event();
        if event.is_set() {
            return true;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.poll_interrupts();
        }
        event.is_set()
    }

    /// Blocks until the GPU has reached this sync point.
    ///
    /// Panics if the sync point is [`SyncPointKind::GpuOnly`]. A sync point whose signaling
    /// payload is never enqueued blocks forever.
    pub fn wait(&self) -> Result<(), DeviceLost> {
        self.wait_inner(None).map(|_| ())
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns whether the sync point completed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, DeviceLost> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<bool, DeviceLost> {
        let event = self.event();
        if event.is_set() {
            return Ok(true);
        }
        match self.engine.upgrade() {
            Some(engine) => engine.wait_for_sync_point(self, deadline),
            None => Ok(match deadline {
                Some(deadline) => event.wait_timeout(deadline.saturating_duration_since(Instant::now())),
                None => {
                    while !event.wait_timeout(Duration::from_secs(1)) {}
                    true
                }
            }),
        }
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("resolved", &self.resolved_value())
            .field("complete", &self.event.as_ref().map(|e| e.is_set()))
            .finish()
    }
}
