//! In-process GPU emulation.
//!
//! Every queue is a FIFO of operations that is advanced whenever the emulated state changes:
//! waits block the queue until their fence is reached, executed command lists run their
//! [`EmulatedCommand`]s against a shared device clock, and signals raise fences. Queues can be
//! paused to simulate a hang, and devices can be removed, after which all of their fences
//! report [`DEVICE_REMOVED_FENCE_VALUE`].
//!
//! All devices created from the same [`EmulatedAdapter`] share one state, so fences can be
//! waited on across devices. The adapter records every operation it retires in an execution
//! log that tests use to check ordering.
use super::{
    downcast, CommandList, HardwareCommandAllocator, HardwareDevice, HardwareFence, HardwareQueryHeap,
    HardwareQueue, QueryType, QueueKind, ReservedResourceCommit, ResourceHandle, DEVICE_REMOVED_FENCE_VALUE,
};
use crate::{
    error::HalError,
    query::{PipelineStatistics, QueryLocation},
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use slotmap::{Key, KeyData, SlotMap};
use std::{
    any::Any,
    collections::VecDeque,
    ops::Range,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{trace, warn};

/// Ticks per second of the emulated device clock.
pub const EMULATED_TIMESTAMP_FREQUENCY: u64 = 10_000_000;

slotmap::new_key_type! {
    pub struct EmulatedFenceId;
    pub struct EmulatedHeapId;
    struct ListId;
}

/// Work recorded into an emulated command list.
#[derive(Clone, Debug, PartialEq)]
pub enum EmulatedCommand {
    /// Advances the device clock, standing in for actual GPU work.
    Work { ticks: u64 },
    WriteTimestamp { heap: EmulatedHeapId, index: u32 },
    Occlusion { heap: EmulatedHeapId, index: u32, samples: u64 },
    PipelineStatistics { heap: EmulatedHeapId, index: u32, statistics: PipelineStatistics },
    /// Copies written query slots into the heap's readback storage.
    Resolve { heap: EmulatedHeapId, range: Range<u32> },
}

impl EmulatedCommand {
    pub fn write_timestamp(location: &QueryLocation) -> Self {
        EmulatedCommand::WriteTimestamp {
            heap: heap_id(location),
            index: location.index(),
        }
    }

    pub fn occlusion(location: &QueryLocation, samples: u64) -> Self {
        EmulatedCommand::Occlusion {
            heap: heap_id(location),
            index: location.index(),
            samples,
        }
    }

    pub fn pipeline_statistics(location: &QueryLocation, statistics: PipelineStatistics) -> Self {
        EmulatedCommand::PipelineStatistics {
            heap: heap_id(location),
            index: location.index(),
            statistics,
        }
    }
}

/// Panics if the location's heap was created by another backend.
fn heap_id(location: &QueryLocation) -> EmulatedHeapId {
    location
        .heap()
        .raw()
        .as_any()
        .downcast_ref::<EmulatedQueryHeap>()
        .expect("query heap was not created by the emulated backend")
        .id
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionEvent {
    Wait { fence: EmulatedFenceId, value: u64 },
    Execute { command_list: CommandList },
    Signal { fence: EmulatedFenceId, value: u64 },
    Commit { resource: ResourceHandle },
}

/// An operation retired by an emulated queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionRecord {
    pub device: usize,
    pub queue: QueueKind,
    pub event: ExecutionEvent,
}

enum Op {
    Wait(EmulatedFenceId, u64),
    Execute(Vec<CommandList>),
    Signal(EmulatedFenceId, u64),
    Commit(Vec<ReservedResourceCommit>),
}

struct FenceSlot {
    device: usize,
    value: u64,
}

struct HeapSlot {
    ty: QueryType,
    written: Vec<u64>,
    resolved: Vec<u64>,
}

struct ListSlot {
    commands: Vec<EmulatedCommand>,
    /// Released once executed.
    one_shot: bool,
}

struct QueueSlot {
    device: usize,
    kind: QueueKind,
    ops: VecDeque<Op>,
    paused: bool,
}

#[derive(Default)]
struct State {
    fences: SlotMap<EmulatedFenceId, FenceSlot>,
    heaps: SlotMap<EmulatedHeapId, HeapSlot>,
    lists: SlotMap<ListId, ListSlot>,
    queues: Vec<QueueSlot>,
    removed: Vec<bool>,
    clock: u64,
    log: Vec<ExecutionRecord>,
}

impl State {
    fn fence_value(&self, id: EmulatedFenceId) -> u64 {
        match self.fences.get(id) {
            Some(fence) if self.removed[fence.device] => DEVICE_REMOVED_FENCE_VALUE,
            Some(fence) => fence.value,
            None => 0,
        }
    }

    /// Retires operations on every queue until none can make progress.
    fn pump(&mut self) {
        loop {
            let mut progress = false;
            for queue in 0..self.queues.len() {
                while self.step(queue) {
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn step(&mut self, queue: usize) -> bool {
        let slot = &self.queues[queue];
        if slot.paused || self.removed[slot.device] {
            return false;
        }
        let runnable = match slot.ops.front() {
            None => return false,
            Some(Op::Wait(fence, value)) => self.fence_value(*fence) >= *value,
            Some(_) => true,
        };
        if !runnable {
            return false;
        }
        let (device, kind) = (slot.device, slot.kind);
        let Some(op) = self.queues[queue].ops.pop_front() else {
            return false;
        };

        match op {
            Op::Wait(fence, value) => {
                self.record(device, kind, ExecutionEvent::Wait { fence, value });
            }
            Op::Execute(command_lists) => {
                for command_list in command_lists {
                    self.run(command_list);
                    self.record(device, kind, ExecutionEvent::Execute { command_list });
                }
            }
            Op::Signal(fence, value) => {
                if let Some(slot) = self.fences.get_mut(fence) {
                    slot.value = slot.value.max(value);
                }
                self.record(device, kind, ExecutionEvent::Signal { fence, value });
            }
            Op::Commit(commits) => {
                for commit in commits {
                    self.record(
                        device,
                        kind,
                        ExecutionEvent::Commit {
                            resource: commit.resource,
                        },
                    );
                }
            }
        }
        true
    }

    fn record(&mut self, device: usize, queue: QueueKind, event: ExecutionEvent) {
        trace!(device, %queue, ?event, "emulated queue retired operation");
        self.log.push(ExecutionRecord { device, queue, event });
    }

    fn run(&mut self, command_list: CommandList) {
        let id = ListId::from(KeyData::from_ffi(command_list.0));
        self.clock += 1;
        let Some(list) = self.lists.get(id) else {
            warn!(?command_list, "executing a released command list");
            return;
        };
        let commands = list.commands.clone();
        if list.one_shot {
            self.lists.remove(id);
        }

        for command in commands {
            match command {
                EmulatedCommand::Work { ticks } => self.clock += ticks,
                EmulatedCommand::WriteTimestamp { heap, index } => {
                    let now = self.clock;
                    self.write_query(heap, index, &[now]);
                }
                EmulatedCommand::Occlusion { heap, index, samples } => self.write_query(heap, index, &[samples]),
                EmulatedCommand::PipelineStatistics { heap, index, statistics } => {
                    self.write_query(heap, index, &statistics.to_words())
                }
                EmulatedCommand::Resolve { heap, range } => {
                    if let Some(HeapSlot { ty, written, resolved }) = self.heaps.get_mut(heap) {
                        let words = ty.words_per_query();
                        let span = range.start as usize * words..range.end as usize * words;
                        resolved[span.clone()].copy_from_slice(&written[span]);
                    }
                }
            }
        }
    }

    fn write_query(&mut self, heap: EmulatedHeapId, index: u32, values: &[u64]) {
        if let Some(slot) = self.heaps.get_mut(heap) {
            let start = index as usize * slot.ty.words_per_query();
            slot.written[start..start + values.len()].copy_from_slice(values);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<State> {
        self.state.lock()
    }

    /// Advances all queues and wakes fence waiters.
    fn pump(&self, mut state: MutexGuard<State>) {
        state.pump();
        drop(state);
        self.changed.notify_all();
    }
}

/// A group of emulated devices sharing one state.
#[derive(Clone)]
pub struct EmulatedAdapter {
    shared: Arc<Shared>,
}

impl Default for EmulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedAdapter {
    pub fn new() -> EmulatedAdapter {
        EmulatedAdapter {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Creates a device exposing one queue of each of the given kinds.
    pub fn create_device(&self, name: &str, queue_kinds: &[QueueKind]) -> Arc<EmulatedDevice> {
        let mut state = self.shared.lock();
        let index = state.removed.len();
        state.removed.push(false);
        let queues = queue_kinds
            .iter()
            .map(|&kind| {
                let slot = state.queues.len();
                state.queues.push(QueueSlot {
                    device: index,
                    kind,
                    ops: VecDeque::new(),
                    paused: false,
                });
                Arc::new(EmulatedQueue {
                    shared: self.shared.clone(),
                    device: index,
                    slot,
                    kind,
                })
            })
            .collect();
        Arc::new(EmulatedDevice {
            index,
            name: name.to_string(),
            shared: self.shared.clone(),
            queues,
        })
    }

    pub fn execution_log(&self) -> Vec<ExecutionRecord> {
        self.shared.lock().log.clone()
    }

    pub fn clear_execution_log(&self) {
        self.shared.lock().log.clear();
    }

    /// Current value of the shared device clock, in ticks.
    pub fn clock(&self) -> u64 {
        self.shared.lock().clock
    }
}

pub struct EmulatedDevice {
    index: usize,
    name: String,
    shared: Arc<Shared>,
    queues: Vec<Arc<EmulatedQueue>>,
}

impl EmulatedDevice {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Records a command list that is released after it has executed once.
    pub fn record(&self, commands: impl IntoIterator<Item = EmulatedCommand>) -> CommandList {
        let mut state = self.shared.lock();
        let id = state.lists.insert(ListSlot {
            commands: commands.into_iter().collect(),
            one_shot: true,
        });
        CommandList(id.data().as_ffi())
    }

    /// Appends commands to a list obtained from an emulated command allocator.
    pub fn append(&self, command_list: CommandList, commands: impl IntoIterator<Item = EmulatedCommand>) {
        let mut state = self.shared.lock();
        let id = ListId::from(KeyData::from_ffi(command_list.0));
        match state.lists.get_mut(id) {
            Some(list) => list.commands.extend(commands),
            None => warn!(?command_list, "appending to a released command list"),
        }
    }

    /// Stops the queue from retiring operations, as if the GPU stopped making progress.
    pub fn pause(&self, kind: QueueKind) {
        let mut state = self.shared.lock();
        if let Some(slot) = self.slot(kind) {
            state.queues[slot].paused = true;
        }
    }

    pub fn resume(&self, kind: QueueKind) {
        let mut state = self.shared.lock();
        if let Some(slot) = self.slot(kind) {
            state.queues[slot].paused = false;
        }
        self.shared.pump(state);
    }

    /// Simulates device removal: every fence of the device reports the removed sentinel.
    pub fn remove(&self) {
        let mut state = self.shared.lock();
        state.removed[self.index] = true;
        warn!(device = %self.name, "emulated device removed");
        self.shared.pump(state);
    }

    /// Number of operations issued to the queue that have not been retired yet.
    pub fn pending_operations(&self, kind: QueueKind) -> usize {
        let state = self.shared.lock();
        self.slot(kind).map_or(0, |slot| state.queues[slot].ops.len())
    }

    fn slot(&self, kind: QueueKind) -> Option<usize> {
        self.queues.iter().find(|queue| queue.kind == kind).map(|queue| queue.slot)
    }
}

impl HardwareDevice for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn HardwareQueue>> {
        self.queues
            .iter()
            .find(|queue| queue.kind == kind)
            .map(|queue| queue.clone() as Arc<dyn HardwareQueue>)
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn HardwareFence>, HalError> {
        let mut state = self.shared.lock();
        let id = state.fences.insert(FenceSlot {
            device: self.index,
            value: initial_value,
        });
        Ok(Arc::new(EmulatedFence {
            shared: self.shared.clone(),
            id,
        }))
    }

    fn create_query_heap(&self, ty: QueryType, capacity: u32) -> Result<Box<dyn HardwareQueryHeap>, HalError> {
        let words = capacity as usize * ty.words_per_query();
        let mut state = self.shared.lock();
        let id = state.heaps.insert(HeapSlot {
            ty,
            written: vec![0; words],
            resolved: vec![0; words],
        });
        Ok(Box::new(EmulatedQueryHeap {
            shared: self.shared.clone(),
            id,
            ty,
            capacity,
        }))
    }

    fn create_command_allocator(&self, _kind: QueueKind) -> Result<Box<dyn HardwareCommandAllocator>, HalError> {
        Ok(Box::new(EmulatedCommandAllocator {
            shared: self.shared.clone(),
            lists: Vec::new(),
        }))
    }
}

pub struct EmulatedQueue {
    shared: Arc<Shared>,
    device: usize,
    slot: usize,
    kind: QueueKind,
}

impl EmulatedQueue {
    fn push(&self, op: Op) -> Result<(), HalError> {
        let mut state = self.shared.lock();
        if state.removed[self.device] {
            return Err(HalError::DeviceLost);
        }
        state.queues[self.slot].ops.push_back(op);
        self.shared.pump(state);
        Ok(())
    }
}

impl HardwareQueue for EmulatedQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, command_lists: &[CommandList]) -> Result<(), HalError> {
        self.push(Op::Execute(command_lists.to_vec()))
    }

    fn wait(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError> {
        let fence = downcast::<EmulatedFence>(fence.as_any(), "fence from another backend")?;
        self.push(Op::Wait(fence.id, value))
    }

    fn signal(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError> {
        let fence = downcast::<EmulatedFence>(fence.as_any(), "fence from another backend")?;
        self.push(Op::Signal(fence.id, value))
    }

    fn update_reserved_resources(&self, commits: &[ReservedResourceCommit]) -> Result<(), HalError> {
        self.push(Op::Commit(commits.to_vec()))
    }

    fn timestamp_frequency(&self) -> u64 {
        EMULATED_TIMESTAMP_FREQUENCY
    }
}

pub struct EmulatedFence {
    shared: Arc<Shared>,
    id: EmulatedFenceId,
}

impl EmulatedFence {
    pub fn id(&self) -> EmulatedFenceId {
        self.id
    }
}

impl HardwareFence for EmulatedFence {
    fn completed_value(&self) -> u64 {
        self.shared.lock().fence_value(self.id)
    }

    fn wait(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let reached = |current: u64| current >= value && (current != DEVICE_REMOVED_FENCE_VALUE || value == current);
        let mut state = self.shared.lock();
        loop {
            let current = state.fence_value(self.id);
            if current >= value {
                return reached(current);
            }
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return reached(state.fence_value(self.id));
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for EmulatedFence {
    fn drop(&mut self) {
        self.shared.lock().fences.remove(self.id);
    }
}

pub struct EmulatedQueryHeap {
    shared: Arc<Shared>,
    id: EmulatedHeapId,
    ty: QueryType,
    capacity: u32,
}

impl EmulatedQueryHeap {
    pub fn id(&self) -> EmulatedHeapId {
        self.id
    }
}

impl HardwareQueryHeap for EmulatedQueryHeap {
    fn query_type(&self) -> QueryType {
        self.ty
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read_results(&self, range: Range<u32>, out: &mut [u64]) -> Result<(), HalError> {
        let state = self.shared.lock();
        let slot = state.heaps.get(self.id).ok_or(HalError::Unsupported("released query heap"))?;
        let words = self.ty.words_per_query();
        let span = range.start as usize * words..range.end as usize * words;
        out.copy_from_slice(&slot.resolved[span]);
        Ok(())
    }

    fn reset(&self) -> Result<(), HalError> {
        let mut state = self.shared.lock();
        if let Some(slot) = state.heaps.get_mut(self.id) {
            slot.written.fill(0);
            slot.resolved.fill(0);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for EmulatedQueryHeap {
    fn drop(&mut self) {
        self.shared.lock().heaps.remove(self.id);
    }
}

pub struct EmulatedCommandAllocator {
    shared: Arc<Shared>,
    lists: Vec<ListId>,
}

impl EmulatedCommandAllocator {
    fn push_list(&mut self, commands: Vec<EmulatedCommand>) -> CommandList {
        let id = self.shared.lock().lists.insert(ListSlot {
            commands,
            one_shot: false,
        });
        self.lists.push(id);
        CommandList(id.data().as_ffi())
    }
}

impl HardwareCommandAllocator for EmulatedCommandAllocator {
    fn allocate(&mut self) -> Result<CommandList, HalError> {
        Ok(self.push_list(Vec::new()))
    }

    fn record_query_resolve(&mut self, runs: &[(&dyn HardwareQueryHeap, Range<u32>)]) -> Result<CommandList, HalError> {
        let mut commands = Vec::with_capacity(runs.len());
        for (heap, range) in runs {
            let heap = downcast::<EmulatedQueryHeap>(heap.as_any(), "query heap from another backend")?;
            commands.push(EmulatedCommand::Resolve {
                heap: heap.id,
                range: range.clone(),
            });
        }
        Ok(self.push_list(commands))
    }

    fn record_timestamp(&mut self, heap: &dyn HardwareQueryHeap, index: u32) -> Result<CommandList, HalError> {
        let heap = downcast::<EmulatedQueryHeap>(heap.as_any(), "query heap from another backend")?;
        Ok(self.push_list(vec![EmulatedCommand::WriteTimestamp { heap: heap.id, index }]))
    }

    fn reset(&mut self) -> Result<(), HalError> {
        let mut state = self.shared.lock();
        for id in self.lists.drain(..) {
            state.lists.remove(id);
        }
        Ok(())
    }
}

impl Drop for EmulatedCommandAllocator {
    fn drop(&mut self) {
        let _ = self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence_of(device: &EmulatedDevice) -> Arc<dyn HardwareFence> {
        device.create_fence(0).unwrap()
    }

    #[test]
    fn waits_block_until_signaled() {
        let adapter = EmulatedAdapter::new();
        let device = adapter.create_device("gpu", &[QueueKind::Direct, QueueKind::Copy]);
        let direct = device.queue(QueueKind::Direct).unwrap();
        let copy = device.queue(QueueKind::Copy).unwrap();
        let fence = fence_of(&device);
        let done = fence_of(&device);

        direct.wait(fence.as_ref(), 1).unwrap();
        direct.signal(done.as_ref(), 7).unwrap();
        assert_eq!(done.completed_value(), 0);
        assert_eq!(device.pending_operations(QueueKind::Direct), 2);

        copy.signal(fence.as_ref(), 1).unwrap();
        assert_eq!(done.completed_value(), 7);
        assert!(done.wait(7, Duration::from_millis(1)));
    }

    #[test]
    fn paused_queue_holds_work_until_resumed() {
        let adapter = EmulatedAdapter::new();
        let device = adapter.create_device("gpu", &[QueueKind::Direct]);
        let queue = device.queue(QueueKind::Direct).unwrap();
        let fence = fence_of(&device);

        device.pause(QueueKind::Direct);
        queue.signal(fence.as_ref(), 1).unwrap();
        assert!(!fence.wait(1, Duration::from_millis(5)));
        device.resume(QueueKind::Direct);
        assert_eq!(fence.completed_value(), 1);
    }

    #[test]
    fn removal_reports_sentinel_and_rejects_work() {
        let adapter = EmulatedAdapter::new();
        let device = adapter.create_device("gpu", &[QueueKind::Direct]);
        let queue = device.queue(QueueKind::Direct).unwrap();
        let fence = fence_of(&device);

        device.remove();
        assert_eq!(fence.completed_value(), DEVICE_REMOVED_FENCE_VALUE);
        assert!(!fence.wait(1, Duration::from_secs(5)));
        assert!(matches!(queue.signal(fence.as_ref(), 1), Err(HalError::DeviceLost)));
    }

    #[test]
    fn resolve_copies_written_slots() {
        let adapter = EmulatedAdapter::new();
        let device = adapter.create_device("gpu", &[QueueKind::Direct]);
        let queue = device.queue(QueueKind::Direct).unwrap();
        let heap = device.create_query_heap(QueryType::Occlusion, 4).unwrap();
        let id = heap.as_any().downcast_ref::<EmulatedQueryHeap>().unwrap().id();

        let write = device.record([
            EmulatedCommand::Occlusion { heap: id, index: 1, samples: 42 },
            EmulatedCommand::Occlusion { heap: id, index: 2, samples: 9 },
        ]);
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let resolve = allocator.record_query_resolve(&[(heap.as_ref(), 1..3)]).unwrap();
        queue.execute(&[write, resolve]).unwrap();

        let mut out = [0; 2];
        heap.read_results(1..3, &mut out).unwrap();
        assert_eq!(out, [42, 9]);
    }
}
