use crate::hal::{HardwareFence, DEVICE_REMOVED_FENCE_VALUE};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Monotonic completion counter of a queue.
///
/// The submission engine assigns each finalized payload the next value and signals it on the
/// hardware queue; the interrupt engine polls the completed value.
pub struct Fence {
    hal: Arc<dyn HardwareFence>,
    name: String,
    /// Value assigned to the next finalized payload.
    next_completion_value: AtomicU64,
    /// Last value a hardware signal has been issued for. Read by the interrupt engine.
    last_signaled_value: AtomicU64,
    /// Highest completed value observed so far.
    last_completed_value: AtomicU64,
}

impl Fence {
    pub(crate) fn new(hal: Arc<dyn HardwareFence>, name: String) -> Fence {
        Fence {
            hal,
            name,
            next_completion_value: AtomicU64::new(1),
            last_signaled_value: AtomicU64::new(0),
            last_completed_value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hal(&self) -> &Arc<dyn HardwareFence> {
        &self.hal
    }

    pub fn next_completion_value(&self) -> u64 {
        self.next_completion_value.load(Ordering::Acquire)
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled_value.load(Ordering::Acquire)
    }

    /// Reserves the value of a payload being finalized.
    pub(crate) fn allocate_value(&self) -> u64 {
        self.next_completion_value.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn mark_signaled(&self, value: u64) {
        debug_assert!(value < self.next_completion_value());
        let previous = self.last_signaled_value.swap(value, Ordering::Release);
        debug_assert!(previous <= value, "fence `{}` signaled out of order", self.name);
    }

    /// Queries the hardware. Returns [`DEVICE_REMOVED_FENCE_VALUE`] if the device was removed.
    pub fn completed_value(&self) -> u64 {
        let value = self.hal.completed_value();
        if value != DEVICE_REMOVED_FENCE_VALUE {
            self.last_completed_value.fetch_max(value, Ordering::AcqRel);
        }
        value
    }

    /// Last completed value observed, without querying the hardware.
    pub fn cached_completed_value(&self) -> u64 {
        self.last_completed_value.load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self, value: u64, timeout: Duration) -> bool {
        self.hal.wait(value, timeout)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("next_completion_value", &self.next_completion_value())
            .field("last_signaled_value", &self.last_signaled_value())
            .field("last_completed_value", &self.cached_completed_value())
            .finish()
    }
}

/// A fence signaled and waited on explicitly by the application, outside of sync points.
#[derive(Clone)]
pub struct ManualFence {
    hal: Arc<dyn HardwareFence>,
}

impl ManualFence {
    pub(crate) fn new(hal: Arc<dyn HardwareFence>) -> ManualFence {
        ManualFence { hal }
    }

    pub fn hal(&self) -> &Arc<dyn HardwareFence> {
        &self.hal
    }

    pub fn completed_value(&self) -> u64 {
        self.hal.completed_value()
    }

    /// Blocks until the fence reaches `value` or the timeout expires.
    pub fn wait(&self, value: u64, timeout: Duration) -> bool {
        self.hal.wait(value, timeout)
    }
}

impl fmt::Debug for ManualFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualFence")
            .field("completed_value", &self.completed_value())
            .finish()
    }
}
