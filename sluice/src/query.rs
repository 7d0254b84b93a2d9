//! Query heaps, allocation and result readback.
//!
//! Producers allocate queries through a [`QueryAllocator`], which bump-allocates slots from
//! heaps taken out of a per-queue [`QueryHeapPool`]. Closed allocations travel with their
//! payload; the submission engine accumulates them per queue and appends a resolve command
//! list to a later payload, and the interrupt engine reads the results back once that payload
//! completes. Heaps return to their pool when the last reference to them is dropped.
use crate::{
    error::HalError,
    hal::{HardwareDevice, HardwareQueryHeap, PipelineStatisticsFlags, QueryType},
};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::{
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, warn};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PipelineStatistics {
    pub input_assembly_vertices: u64,
    pub input_assembly_primitives: u64,
    pub vertex_shader_invocations: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub fragment_shader_invocations: u64,
    pub compute_shader_invocations: u64,
}

impl PipelineStatistics {
    pub fn from_words(words: &[u64]) -> PipelineStatistics {
        let word = |i: usize| words.get(i).copied().unwrap_or(0);
        PipelineStatistics {
            input_assembly_vertices: word(0),
            input_assembly_primitives: word(1),
            vertex_shader_invocations: word(2),
            clipping_invocations: word(3),
            clipping_primitives: word(4),
            fragment_shader_invocations: word(5),
            compute_shader_invocations: word(6),
        }
    }

    pub fn to_words(&self) -> [u64; 7] {
        [
            self.input_assembly_vertices,
            self.input_assembly_primitives,
            self.vertex_shader_invocations,
            self.clipping_invocations,
            self.clipping_primitives,
            self.fragment_shader_invocations,
            self.compute_shader_invocations,
        ]
    }

    /// Returns the counter selected by a single flag.
    pub fn get(&self, counter: PipelineStatisticsFlags) -> Option<u64> {
        let position = PipelineStatisticsFlags::all()
            .iter()
            .position(|flag| flag == counter)?;
        Some(self.to_words()[position])
    }
}

/// Unit in which timestamp query results are delivered.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TimestampUnit {
    /// Raw device ticks.
    Ticks,
    Nanoseconds,
    #[default]
    Microseconds,
    Milliseconds,
}

impl TimestampUnit {
    /// Converts `ticks` of a clock running at `frequency` ticks per second.
    pub fn convert(self, ticks: u64, frequency: u64) -> u64 {
        let per_second: u128 = match self {
            TimestampUnit::Ticks => return ticks,
            TimestampUnit::Nanoseconds => 1_000_000_000,
            TimestampUnit::Microseconds => 1_000_000,
            TimestampUnit::Milliseconds => 1_000,
        };
        if frequency == 0 {
            return 0;
        }
        (ticks as u128 * per_second / frequency as u128).min(u64::MAX as u128) as u64
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueryValue {
    Occlusion(u64),
    /// Converted to the unit of the destination [`QueryResult`].
    Timestamp(u64),
    PipelineStatistics(PipelineStatistics),
}

impl QueryValue {
    fn decode(ty: QueryType, words: &[u64], unit: TimestampUnit, frequency: u64) -> QueryValue {
        let first = words.first().copied().unwrap_or(0);
        match ty {
            QueryType::Occlusion => QueryValue::Occlusion(first),
            QueryType::Timestamp => QueryValue::Timestamp(unit.convert(first, frequency)),
            QueryType::PipelineStatistics => QueryValue::PipelineStatistics(PipelineStatistics::from_words(words)),
        }
    }
}

/// Caller-owned destination of a query result, filled in when the query's payload completes.
#[derive(Debug, Default)]
pub struct QueryResult {
    unit: TimestampUnit,
    value: Mutex<Option<QueryValue>>,
}

impl QueryResult {
    pub fn new() -> Arc<QueryResult> {
        Arc::new(QueryResult::default())
    }

    pub fn with_unit(unit: TimestampUnit) -> Arc<QueryResult> {
        Arc::new(QueryResult {
            unit,
            value: Mutex::new(None),
        })
    }

    pub fn unit(&self) -> TimestampUnit {
        self.unit
    }

    pub fn get(&self) -> Option<QueryValue> {
        self.value.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.value.lock().is_some()
    }

    fn store(&self, value: QueryValue) {
        *self.value.lock() = Some(value);
    }
}

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// A hardware query heap checked out of a pool.
///
/// Dropping the last reference resets the hardware heap and returns it to the pool.
pub struct QueryHeap {
    id: u64,
    ty: QueryType,
    capacity: u32,
    /// Taken when the heap goes back to its pool.
    raw: Option<Box<dyn HardwareQueryHeap>>,
    pool: Weak<QueryHeapPool>,
}

impl QueryHeap {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn raw(&self) -> &dyn HardwareQueryHeap {
        self.raw.as_deref().expect("query heap used after release")
    }
}

impl fmt::Debug for QueryHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHeap")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for QueryHeap {
    fn drop(&mut self) {
        if let (Some(raw), Some(pool)) = (self.raw.take(), self.pool.upgrade()) {
            pool.recycle(raw);
        }
    }
}

/// Recycles hardware heaps of one type and capacity for one queue.
pub(crate) struct QueryHeapPool {
    device: Arc<dyn HardwareDevice>,
    ty: QueryType,
    capacity: u32,
    free: Mutex<Vec<Box<dyn HardwareQueryHeap>>>,
    created: AtomicUsize,
}

impl QueryHeapPool {
    pub(crate) fn new(device: Arc<dyn HardwareDevice>, ty: QueryType, capacity: u32) -> Arc<QueryHeapPool> {
        Arc::new(QueryHeapPool {
            device,
            ty,
            capacity: capacity.max(1),
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Result<Arc<QueryHeap>, HalError> {
        let recycled = self.free.lock().pop();
        let raw = match recycled {
            Some(raw) => raw,
            None => {
                let raw = self.device.create_query_heap(self.ty, self.capacity)?;
                let count = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(ty = ?self.ty, capacity = self.capacity, count, "created query heap");
                raw
            }
        };
        Ok(Arc::new(QueryHeap {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            ty: self.ty,
            capacity: self.capacity,
            raw: Some(raw),
            pool: Arc::downgrade(self),
        }))
    }

    fn recycle(&self, raw: Box<dyn HardwareQueryHeap>) {
        match raw.reset() {
            Ok(()) => self.free.lock().push(raw),
            Err(err) => warn!("failed to reset query heap, dropping it: {err}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Slot of a query in a heap.
#[derive(Clone, Debug)]
pub struct QueryLocation {
    heap: Arc<QueryHeap>,
    index: u32,
}

impl QueryLocation {
    pub fn heap(&self) -> &Arc<QueryHeap> {
        &self.heap
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn query_type(&self) -> QueryType {
        self.heap.ty
    }
}

/// A contiguous range of slots in one heap.
#[derive(Clone, Debug)]
pub struct QueryRange {
    pub heap: Arc<QueryHeap>,
    pub range: Range<u32>,
}

/// Sorts ranges by heap and start, merging ranges of the same heap that overlap or touch.
pub fn coalesce_ranges(ranges: impl IntoIterator<Item = QueryRange>) -> Vec<QueryRange> {
    let mut ranges: Vec<QueryRange> = ranges.into_iter().filter(|r| r.range.start < r.range.end).collect();
    ranges.sort_by_key(|r| (r.heap.id, r.range.start));

    let mut merged: Vec<QueryRange> = Vec::with_capacity(ranges.len());
    for next in ranges {
        match merged.last_mut() {
            Some(last) if last.heap.id == next.heap.id && next.range.start <= last.range.end => {
                last.range.end = last.range.end.max(next.range.end);
            }
            _ => merged.push(next),
        }
    }
    merged
}

#[derive(Debug)]
pub(crate) struct PendingQuery {
    pub(crate) location: QueryLocation,
    /// `None` for engine-internal timing queries.
    pub(crate) target: Option<Arc<QueryResult>>,
}

/// Queries allocated by a producer, handed to a payload with `Payload::add_queries`.
#[derive(Debug, Default)]
pub struct QueryBatch {
    pub(crate) queries: Vec<PendingQuery>,
    pub(crate) ranges: Vec<QueryRange>,
}

impl QueryBatch {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub(crate) fn append(&mut self, other: QueryBatch) {
        self.queries.extend(other.queries);
        self.ranges.extend(other.ranges);
    }
}

#[derive(Default)]
struct Cursor {
    heap: Option<Arc<QueryHeap>>,
    next: u32,
}

/// Bump allocator over the query heaps of one queue. Owned by a single producer.
pub struct QueryAllocator {
    pools: [Arc<QueryHeapPool>; 3],
    cursors: [Cursor; 3],
    batch: QueryBatch,
}

impl QueryAllocator {
    pub(crate) fn new(pools: [Arc<QueryHeapPool>; 3]) -> QueryAllocator {
        QueryAllocator {
            pools,
            cursors: Default::default(),
            batch: QueryBatch::default(),
        }
    }

    /// Allocates a query whose result will be written to `target` once it has been resolved.
    pub fn allocate(&mut self, ty: QueryType, target: Arc<QueryResult>) -> Result<QueryLocation, HalError> {
        let location = self.allocate_slot(ty)?;
        self.batch.queries.push(PendingQuery {
            location: location.clone(),
            target: Some(target),
        });
        Ok(location)
    }

    /// Allocates a query that is resolved with the batch but delivered to nobody.
    pub(crate) fn allocate_internal(&mut self, ty: QueryType) -> Result<QueryLocation, HalError> {
        let location = self.allocate_slot(ty)?;
        self.batch.queries.push(PendingQuery {
            location: location.clone(),
            target: None,
        });
        Ok(location)
    }

    fn allocate_slot(&mut self, ty: QueryType) -> Result<QueryLocation, HalError> {
        let cursor = &mut self.cursors[ty.index()];
        let heap = match &cursor.heap {
            Some(heap) if cursor.next < heap.capacity => heap.clone(),
            _ => {
                let heap = self.pools[ty.index()].acquire()?;
                cursor.heap = Some(heap.clone());
                cursor.next = 0;
                heap
            }
        };
        let index = cursor.next;
        cursor.next += 1;

        match self.batch.ranges.last_mut() {
            Some(last) if Arc::ptr_eq(&last.heap, &heap) && last.range.end == index => last.range.end += 1,
            _ => self.batch.ranges.push(QueryRange {
                heap: heap.clone(),
                range: index..index + 1,
            }),
        }
        Ok(QueryLocation { heap, index })
    }

    /// Number of queries allocated since the last call to `close`.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Takes the queries allocated so far.
    pub fn close(&mut self) -> QueryBatch {
        std::mem::take(&mut self.batch)
    }
}

/// Begin/end timestamps bracketing the command lists of one payload.
#[derive(Debug)]
pub(crate) struct TimingPair {
    pub(crate) begin: QueryLocation,
    pub(crate) end: QueryLocation,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct TimingSample {
    pub(crate) busy_ticks: u64,
    pub(crate) payloads: u64,
}

/// Queries resolved by a payload's resolve command list.
#[derive(Debug, Default)]
pub(crate) struct ResolveBatch {
    pub(crate) queries: Vec<PendingQuery>,
    pub(crate) runs: Vec<QueryRange>,
    pub(crate) timing: Vec<TimingPair>,
}

type Readback = FxHashMap<u64, Vec<(Range<u32>, Vec<u64>)>>;

fn lookup<'a>(readback: &'a Readback, location: &QueryLocation) -> Option<&'a [u64]> {
    let words = location.query_type().words_per_query();
    readback
        .get(&location.heap.id)?
        .iter()
        .find(|(range, _)| range.contains(&location.index))
        .map(|(range, data)| {
            let offset = (location.index - range.start) as usize * words;
            &data[offset..offset + words]
        })
}

impl ResolveBatch {
    pub(crate) fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Reads back every resolved run, fills the destinations and measures timing pairs.
    pub(crate) fn read_back(&self, frequency: u64) -> Result<TimingSample, HalError> {
        let mut readback = Readback::default();
        for run in &self.runs {
            let words = run.heap.ty.words_per_query();
            let mut data = vec![0; (run.range.end - run.range.start) as usize * words];
            run.heap.raw().read_results(run.range.clone(), &mut data)?;
            readback.entry(run.heap.id).or_default().push((run.range.clone(), data));
        }

        for query in &self.queries {
            let Some(target) = &query.target else { continue };
            match lookup(&readback, &query.location) {
                Some(words) => target.store(QueryValue::decode(
                    query.location.query_type(),
                    words,
                    target.unit,
                    frequency,
                )),
                None => warn!(index = query.location.index, "query was not covered by any resolve run"),
            }
        }

        let mut sample = TimingSample::default();
        for pair in &self.timing {
            if let (Some(begin), Some(end)) = (lookup(&readback, &pair.begin), lookup(&readback, &pair.end)) {
                sample.busy_ticks += end[0].saturating_sub(begin[0]);
                sample.payloads += 1;
            }
        }
        Ok(sample)
    }
}
