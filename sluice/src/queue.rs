use crate::{
    config::Config,
    error::HalError,
    fence::Fence,
    hal::{HardwareCommandAllocator, HardwareDevice, HardwareQueue, QueryType, QueueKind},
    payload::Payload,
    query::{QueryAllocator, QueryHeapPool, TimingSample},
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

/// Identifies a queue: the index of its device in the engine, and its kind.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct QueueId {
    pub device: usize,
    pub kind: QueueKind,
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.kind)
    }
}

/// GPU time accumulated by a queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct QueueTiming {
    /// Sum of the time between the begin and end timestamps of each payload.
    pub busy: Duration,
    pub payloads: u64,
}

/// Command allocator checked out of a queue's pool.
///
/// Hand it to the payload whose command lists it recorded with `Payload::retain_allocator`;
/// it is reset and returned to the pool once that payload retires.
pub struct CommandAllocator {
    kind: QueueKind,
    raw: Box<dyn HardwareCommandAllocator>,
}

impl CommandAllocator {
    pub fn kind(&self) -> QueueKind {
        self.kind
    }
}

impl Deref for CommandAllocator {
    type Target = dyn HardwareCommandAllocator;

    fn deref(&self) -> &Self::Target {
        &*self.raw
    }
}

impl DerefMut for CommandAllocator {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.raw
    }
}

/// A hardware queue and the engine state attached to it.
pub struct Queue {
    id: QueueId,
    index: usize,
    name: String,
    device: Arc<dyn HardwareDevice>,
    hal: Arc<dyn HardwareQueue>,
    fence: Arc<Fence>,
    query_pools: [Arc<QueryHeapPool>; 3],
    free_allocators: Mutex<Vec<Box<dyn HardwareCommandAllocator>>>,
    timing: Mutex<QueueTiming>,
    timestamp_frequency: u64,
    /// Payloads handed to the hardware, in submission order, waiting to be retired.
    pub(crate) interrupt_sender: Sender<Box<Payload>>,
    pub(crate) interrupt_receiver: Receiver<Box<Payload>>,
}

impl Queue {
    pub(crate) fn new(
        id: QueueId,
        index: usize,
        device: Arc<dyn HardwareDevice>,
        hal: Arc<dyn HardwareQueue>,
        config: &Config,
    ) -> Result<Arc<Queue>, HalError> {
        let name = format!("{}/{}", device.name(), id.kind);
        let fence = Arc::new(Fence::new(device.create_fence(0)?, name.clone()));
        let query_pools =
            QueryType::ALL.map(|ty| QueryHeapPool::new(device.clone(), ty, config.queries.heap_capacity));
        let (interrupt_sender, interrupt_receiver) = crossbeam_channel::unbounded();
        let timestamp_frequency = hal.timestamp_frequency();
        debug!(queue = %name, timestamp_frequency, "created queue");
        Ok(Arc::new(Queue {
            id,
            index,
            name,
            device,
            hal,
            fence,
            query_pools,
            free_allocators: Mutex::new(Vec::new()),
            timing: Mutex::new(QueueTiming::default()),
            timestamp_frequency,
            interrupt_sender,
            interrupt_receiver,
        }))
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn kind(&self) -> QueueKind {
        self.id.kind
    }

    /// Position of the queue in `Engine::queues`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hal(&self) -> &Arc<dyn HardwareQueue> {
        &self.hal
    }

    pub fn device(&self) -> &Arc<dyn HardwareDevice> {
        &self.device
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Timestamp ticks per second.
    pub fn timestamp_frequency(&self) -> u64 {
        self.timestamp_frequency
    }

    /// Creates a query allocator drawing from this queue's heaps.
    pub fn query_allocator(&self) -> QueryAllocator {
        QueryAllocator::new(self.query_pools.clone())
    }

    /// Returns a free command allocator, creating one if the pool is empty.
    pub fn acquire_command_allocator(&self) -> Result<CommandAllocator, HalError> {
        let recycled = self.free_allocators.lock().pop();
        let raw = match recycled {
            Some(raw) => raw,
            None => {
                debug!(queue = %self.name, "creating command allocator");
                self.device.create_command_allocator(self.id.kind)?
            }
        };
        Ok(CommandAllocator {
            kind: self.id.kind,
            raw,
        })
    }

    pub(crate) fn release_command_allocator(&self, mut allocator: CommandAllocator) {
        match allocator.raw.reset() {
            Ok(()) => self.free_allocators.lock().push(allocator.raw),
            Err(err) => warn!(queue = %self.name, "failed to reset command allocator, dropping it: {err}"),
        }
    }

    pub(crate) fn free_allocator_count(&self) -> usize {
        self.free_allocators.lock().len()
    }

    pub(crate) fn record_timing(&self, sample: TimingSample) {
        if sample.payloads == 0 {
            return;
        }
        let busy_ns = crate::query::TimestampUnit::Nanoseconds.convert(sample.busy_ticks, self.timestamp_frequency);
        let mut timing = self.timing.lock();
        timing.busy += Duration::from_nanos(busy_ns);
        timing.payloads += sample.payloads;
    }

    pub(crate) fn take_timing(&self) -> QueueTiming {
        std::mem::take(&mut *self.timing.lock())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fence", &self.fence)
            .finish()
    }
}
