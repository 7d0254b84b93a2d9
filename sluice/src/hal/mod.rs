//! Hardware abstraction layer.
//!
//! The engine only talks to the GPU through the traits in this module. Two backends are
//! provided: [`vulkan`], which drives an existing `ash::Device`, and [`emulated`], an
//! in-process GPU used for testing the engine without hardware.
use crate::error::HalError;
use std::{any::Any, fmt, ops::Range, sync::Arc, time::Duration};

pub mod emulated;
pub mod vulkan;

/// Completed value reported by a fence once its device has been removed.
pub const DEVICE_REMOVED_FENCE_VALUE: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy];

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Direct => "direct",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueryType {
    Occlusion,
    Timestamp,
    PipelineStatistics,
}

impl QueryType {
    pub const ALL: [QueryType; 3] = [QueryType::Occlusion, QueryType::Timestamp, QueryType::PipelineStatistics];

    /// Number of 64-bit words a single resolved query occupies.
    pub fn words_per_query(self) -> usize {
        match self {
            QueryType::PipelineStatistics => PipelineStatisticsFlags::all().bits().count_ones() as usize,
            _ => 1,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            QueryType::Occlusion => 0,
            QueryType::Timestamp => 1,
            QueryType::PipelineStatistics => 2,
        }
    }
}

bitflags::bitflags! {
    /// Counters collected by pipeline statistics queries, in result order.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PipelineStatisticsFlags: u32 {
        const INPUT_ASSEMBLY_VERTICES = 1 << 0;
        const INPUT_ASSEMBLY_PRIMITIVES = 1 << 1;
        const VERTEX_SHADER_INVOCATIONS = 1 << 2;
        const CLIPPING_INVOCATIONS = 1 << 3;
        const CLIPPING_PRIMITIVES = 1 << 4;
        const FRAGMENT_SHADER_INVOCATIONS = 1 << 5;
        const COMPUTE_SHADER_INVOCATIONS = 1 << 6;
    }
}

/// Opaque handle to a closed command list, owned by a [`HardwareCommandAllocator`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CommandList(pub u64);

/// Opaque handle to a reserved (sparse) resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceHandle(pub u64);

/// Maps a range of a reserved resource to device memory, or unmaps it when `memory` is `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReservedBinding {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<u64>,
    pub memory_offset: u64,
}

/// A batch of mapping updates for one reserved resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReservedResourceCommit {
    pub resource: ResourceHandle,
    pub bindings: Vec<ReservedBinding>,
}

pub trait HardwareDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the hardware queue of the given kind, if the device exposes one.
    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn HardwareQueue>>;

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn HardwareFence>, HalError>;

    fn create_query_heap(&self, ty: QueryType, capacity: u32) -> Result<Box<dyn HardwareQueryHeap>, HalError>;

    fn create_command_allocator(&self, kind: QueueKind) -> Result<Box<dyn HardwareCommandAllocator>, HalError>;
}

/// A hardware queue. Operations are executed in the order they are issued.
pub trait HardwareQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn execute(&self, command_lists: &[CommandList]) -> Result<(), HalError>;

    /// Blocks subsequent work on this queue until `fence` reaches `value`.
    fn wait(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError>;

    /// Sets `fence` to `value` once all previously issued work has completed.
    fn signal(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError>;

    fn update_reserved_resources(&self, commits: &[ReservedResourceCommit]) -> Result<(), HalError>;

    /// Timestamp ticks per second.
    fn timestamp_frequency(&self) -> u64;
}

pub trait HardwareFence: Send + Sync {
    /// Returns the completed value, or [`DEVICE_REMOVED_FENCE_VALUE`] if the device was removed.
    fn completed_value(&self) -> u64;

    /// Blocks until the fence reaches `value`, the device is removed, or the timeout expires.
    ///
    /// Returns whether the fence reached `value`.
    fn wait(&self, value: u64, timeout: Duration) -> bool;

    fn as_any(&self) -> &dyn Any;
}

pub trait HardwareQueryHeap: Send + Sync {
    fn query_type(&self) -> QueryType;

    fn capacity(&self) -> u32;

    /// Copies the resolved results of `range` into `out`.
    ///
    /// `out` holds `query_type().words_per_query()` words per query.
    fn read_results(&self, range: Range<u32>, out: &mut [u64]) -> Result<(), HalError>;

    /// Makes every query of the heap available for reuse.
    fn reset(&self) -> Result<(), HalError>;

    fn as_any(&self) -> &dyn Any;
}

/// Allocates command lists for one queue kind. Lists remain valid until the next `reset`.
pub trait HardwareCommandAllocator: Send {
    fn allocate(&mut self) -> Result<CommandList, HalError>;

    /// Records a command list that copies the results of `runs` into each heap's readback storage.
    fn record_query_resolve(&mut self, runs: &[(&dyn HardwareQueryHeap, Range<u32>)]) -> Result<CommandList, HalError>;

    /// Records a command list that writes a timestamp into `heap` at `index`.
    fn record_timestamp(&mut self, heap: &dyn HardwareQueryHeap, index: u32) -> Result<CommandList, HalError>;

    fn reset(&mut self) -> Result<(), HalError>;
}

/// Downcasts a hardware object created by a specific backend.
pub(crate) fn downcast<'a, T: 'static>(object: &'a dyn Any, what: &'static str) -> Result<&'a T, HalError> {
    object.downcast_ref::<T>().ok_or(HalError::Unsupported(what))
}
