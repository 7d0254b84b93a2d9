//! GPU command submission and completion pipeline.
//!
//! Producers build [`Payload`]s (command lists plus the [`SyncPoint`]s they wait on and signal)
//! and hand them to an [`Engine`]. The submission engine orders them per queue, resolves
//! cross-queue dependencies into fence waits and batches them into hardware submissions. The
//! interrupt engine retires completed payloads: it reads back their queries, wakes CPU waiters
//! and recycles their resources. Hangs and device removal are reported through a crash handler.
//!
//! Hardware access goes through the traits in [`hal`], implemented for Vulkan and for an
//! in-process emulated GPU.
pub use ash::{self, vk};

pub use config::*;
pub use diagnostics::{CrashHandler, CrashReport, DependencyReport, GpuCrash, HangReport, PayloadReport, QueueReport};
pub use engine::{Engine, EngineStats, FrameTiming};
pub use error::*;
pub use fence::{Fence, ManualFence};
pub use payload::{Cleanup, Payload, PayloadWork};
pub use query::{
    coalesce_ranges, PipelineStatistics, QueryAllocator, QueryBatch, QueryHeap, QueryLocation, QueryRange, QueryResult,
    QueryValue, TimestampUnit,
};
pub use queue::{CommandAllocator, Queue, QueueId, QueueTiming};
pub use sync_point::{SyncPoint, SyncPointKind, SyncPointRef};

mod config;
mod diagnostics;
mod engine;
mod error;
mod fence;
pub mod hal;
mod interrupt;
mod payload;
mod query;
mod queue;
mod submission;
mod sync_point;
