//! Units of work submitted to a queue.
use crate::{
    fence::ManualFence,
    hal::{CommandList, ReservedResourceCommit},
    interrupt::HangCheck,
    query::{QueryBatch, QueryHeap, ResolveBatch},
    queue::{CommandAllocator, Queue},
    sync_point::{SyncPointKind, SyncPointRef},
};
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

static NEXT_PAYLOAD_SERIAL: AtomicU64 = AtomicU64::new(1);

bitflags::bitflags! {
    /// Kinds of work a payload carries.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PayloadWork: u32 {
        const COMMAND_LISTS = 1 << 0;
        const WAIT = 1 << 1;
        const SIGNAL = 1 << 2;
        const RESERVED_RESOURCES = 1 << 3;
        const QUERIES = 1 << 4;
        const RESOLVE = 1 << 5;
    }
}

/// Resources released when a payload retires.
pub enum Cleanup {
    /// Reset and returned to the queue's allocator pool.
    CommandAllocator(CommandAllocator),
    /// Kept alive until the GPU is done with it.
    QueryHeap(Arc<QueryHeap>),
    Object(Box<dyn Any + Send>),
    /// Runs on the thread retiring the payload.
    Callback(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::CommandAllocator(allocator) => write!(f, "CommandAllocator({})", allocator.kind()),
            Cleanup::QueryHeap(heap) => write!(f, "QueryHeap({})", heap.id()),
            Cleanup::Object(_) => f.write_str("Object"),
            Cleanup::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A unit of work bound to one queue.
///
/// Built by a producer, then handed to the engine with `Engine::enqueue`. The engine records a
/// single hardware submission for consecutive payloads where possible, but the waits, signals
/// and command lists of each payload are executed in the order they were added.
pub struct Payload {
    pub(crate) queue: Arc<Queue>,
    pub(crate) serial: u64,
    pub(crate) label: Option<String>,
    pub(crate) command_lists: Vec<CommandList>,
    pub(crate) sync_points_to_wait: Vec<SyncPointRef>,
    /// Index of the first wait not yet known to be resolved.
    pub(crate) wait_cursor: usize,
    pub(crate) sync_points_to_signal: Vec<SyncPointRef>,
    pub(crate) manual_fence_waits: Vec<(ManualFence, u64)>,
    pub(crate) manual_fence_signals: Vec<(ManualFence, u64)>,
    pub(crate) reserved_resource_commits: Vec<ReservedResourceCommit>,
    pub(crate) queries: QueryBatch,
    pub(crate) always_signal: bool,
    pub(crate) submitted: AtomicBool,
    pub(crate) completion_fence_value: Option<u64>,
    pub(crate) submission_time: Option<Instant>,
    pub(crate) hang_check: HangCheck,
    pub(crate) resolve: Option<ResolveBatch>,
    pub(crate) cleanup: Vec<Cleanup>,
}

impl Payload {
    pub fn new(queue: &Arc<Queue>) -> Payload {
        Payload {
            queue: queue.clone(),
            serial: NEXT_PAYLOAD_SERIAL.fetch_add(1, Ordering::Relaxed),
            label: None,
            command_lists: Vec::new(),
            sync_points_to_wait: Vec::new(),
            wait_cursor: 0,
            sync_points_to_signal: Vec::new(),
            manual_fence_waits: Vec::new(),
            manual_fence_signals: Vec::new(),
            reserved_resource_commits: Vec::new(),
            queries: QueryBatch::default(),
            always_signal: false,
            submitted: AtomicBool::new(false),
            completion_fence_value: None,
            submission_time: None,
            hang_check: HangCheck::default(),
            resolve: None,
            cleanup: Vec::new(),
        }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn set_label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    pub fn push_command_list(&mut self, command_list: CommandList) -> &mut Self {
        self.command_lists.push(command_list);
        self
    }

    pub fn command_lists(&self) -> &[CommandList] {
        &self.command_lists
    }

    /// Makes the payload wait until `sync_point` has been reached.
    pub fn wait(&mut self, sync_point: &SyncPointRef) -> &mut Self {
        self.sync_points_to_wait.push(sync_point.clone());
        self
    }

    /// Makes `sync_point` complete once this payload has executed.
    ///
    /// Panics if the sync point is already signaled by another payload.
    pub fn signal(&mut self, sync_point: &SyncPointRef) -> &mut Self {
        assert!(
            !sync_point.is_resolved(),
            "sync point {} is already signaled by another payload",
            sync_point.id()
        );
        self.sync_points_to_signal.push(sync_point.clone());
        self
    }

    pub fn wait_manual_fence(&mut self, fence: &ManualFence, value: u64) -> &mut Self {
        self.manual_fence_waits.push((fence.clone(), value));
        self
    }

    pub fn signal_manual_fence(&mut self, fence: &ManualFence, value: u64) -> &mut Self {
        self.manual_fence_signals.push((fence.clone(), value));
        self
    }

    pub fn commit_reserved_resource(&mut self, commit: ReservedResourceCommit) -> &mut Self {
        self.reserved_resource_commits.push(commit);
        self
    }

    /// Attaches queries allocated for the command lists of this payload.
    pub fn add_queries(&mut self, batch: QueryBatch) -> &mut Self {
        self.queries.append(batch);
        self
    }

    /// Keeps the allocator of this payload's command lists until the payload retires.
    pub fn retain_allocator(&mut self, allocator: CommandAllocator) -> &mut Self {
        self.cleanup.push(Cleanup::CommandAllocator(allocator));
        self
    }

    /// Keeps `object` alive until the payload retires.
    pub fn retain(&mut self, object: impl Any + Send) -> &mut Self {
        self.cleanup.push(Cleanup::Object(Box::new(object)));
        self
    }

    pub fn defer(&mut self, cleanup: Cleanup) -> &mut Self {
        self.cleanup.push(cleanup);
        self
    }

    /// Runs `callback` once the payload retires.
    ///
    /// Callbacks run on the thread that retired the payload, after it has released the
    /// interrupt engine. With a dedicated interrupt thread a callback that blocks on a sync point
    /// stalls retirement for every queue.
    pub fn on_retire(&mut self, callback: impl FnOnce() + Send + 'static) -> &mut Self {
        self.cleanup.push(Cleanup::Callback(Box::new(callback)));
        self
    }

    /// Forces a fence signal after this payload even when nothing depends on it.
    pub fn set_always_signal(&mut self, always_signal: bool) -> &mut Self {
        self.always_signal = always_signal;
        self
    }

    pub fn work(&self) -> PayloadWork {
        let mut work = PayloadWork::empty();
        work.set(PayloadWork::COMMAND_LISTS, !self.command_lists.is_empty());
        work.set(PayloadWork::WAIT, self.has_wait_work());
        work.set(PayloadWork::SIGNAL, self.has_signal_work());
        work.set(PayloadWork::RESERVED_RESOURCES, self.has_update_reserved_resources_work());
        work.set(PayloadWork::QUERIES, !self.queries.is_empty());
        work.set(PayloadWork::RESOLVE, self.resolve.is_some());
        work
    }

    pub fn has_wait_work(&self) -> bool {
        !self.sync_points_to_wait.is_empty() || !self.manual_fence_waits.is_empty()
    }

    pub fn has_signal_work(&self) -> bool {
        !self.sync_points_to_signal.is_empty() || !self.manual_fence_signals.is_empty()
    }

    pub fn has_update_reserved_resources_work(&self) -> bool {
        !self.reserved_resource_commits.is_empty()
    }

    /// Whether the queue fence must be signaled right after this payload.
    pub fn requires_fence_signal(&self) -> bool {
        self.has_signal_work() || self.resolve.is_some() || self.always_signal
    }

    pub(crate) fn signals_cpu_sync_point(&self) -> bool {
        self.sync_points_to_signal
            .iter()
            .any(|sync_point| sync_point.kind() == SyncPointKind::GpuAndCpu)
    }

    /// Whether the payload has been handed to the hardware.
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completion_fence_value(&self) -> Option<u64> {
        self.completion_fence_value
    }

    /// Moves the wait cursor past every resolved sync point.
    ///
    /// Returns `false` if a wait is still unresolved.
    pub(crate) fn advance_wait_cursor(&mut self) -> bool {
        while let Some(sync_point) = self.sync_points_to_wait.get(self.wait_cursor) {
            if !sync_point.is_resolved() {
                return false;
            }
            self.wait_cursor += 1;
        }
        true
    }

    /// First sync point this payload is blocked on.
    pub(crate) fn blocking_sync_point(&self) -> Option<&SyncPointRef> {
        self.sync_points_to_wait.get(self.wait_cursor)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("queue", &self.queue.name())
            .field("serial", &self.serial)
            .field("label", &self.label)
            .field("work", &self.work())
            .field("completion_fence_value", &self.completion_fence_value)
            .field("submitted", &self.is_submitted())
            .finish()
    }
}
