//! Submission engine.
//!
//! Moves enqueued payloads into per-queue FIFOs, waits for their sync points to be resolved,
//! assigns completion fence values and folds consecutive payloads into as few hardware
//! submissions as their waits and signals allow.
use crate::{
    config::Config,
    engine::Counters,
    error::HalError,
    fence::{Fence, ManualFence},
    hal::{CommandList, HardwareQueryHeap, QueryType, ReservedResourceCommit},
    payload::{Cleanup, Payload},
    query::{coalesce_ranges, QueryAllocator, QueryBatch, ResolveBatch, TimingPair},
    queue::Queue,
};
use crossbeam_channel::Receiver;
use std::{
    collections::VecDeque,
    mem,
    ops::Range,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tracing::{debug, trace, trace_span};

/// Work of consecutive payloads issued as one hardware submission.
#[derive(Default)]
struct Batch {
    fence_waits: Vec<(Arc<Fence>, u64)>,
    manual_waits: Vec<(ManualFence, u64)>,
    commits: Vec<ReservedResourceCommit>,
    command_lists: Vec<CommandList>,
    manual_signals: Vec<(ManualFence, u64)>,
    payloads: Vec<Box<Payload>>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn push(&mut self, mut payload: Box<Payload>) {
        self.command_lists.extend_from_slice(&payload.command_lists);
        self.commits.append(&mut payload.reserved_resource_commits);
        self.manual_signals.extend(payload.manual_fence_signals.iter().cloned());
        self.payloads.push(payload);
    }
}

struct QueueState {
    queue: Arc<Queue>,
    counters: Arc<Counters>,
    pending: VecDeque<Box<Payload>>,
    /// Queries of finalized payloads that have not been resolved yet.
    queries: QueryBatch,
    timing: Vec<TimingPair>,
    timing_queries: Option<QueryAllocator>,
    batch: Batch,
}

impl QueueState {
    /// Submits payloads until the head of the queue is blocked. Returns the number of payloads
    /// taken off the queue.
    fn process(&mut self, config: &Config) -> Result<usize, HalError> {
        let mut processed = 0;
        while let Some(head) = self.pending.front_mut() {
            if !head.advance_wait_cursor() {
                if let Some(sync_point) = head.blocking_sync_point() {
                    trace!(
                        queue = %self.queue.name(),
                        payload = head.serial,
                        sync_point = sync_point.id(),
                        "payload waiting for an unresolved sync point"
                    );
                }
                break;
            }
            let Some(mut payload) = self.pending.pop_front() else {
                break;
            };
            processed += 1;

            let boundary = payload.has_wait_work()
                || payload.has_update_reserved_resources_work()
                || self.batch.payloads.len() >= config.submission.max_batched_payloads.max(1);
            if boundary && !self.batch.is_empty() {
                self.flush()?;
            }

            self.gather_waits(&payload);
            self.gather_queries(&mut payload, config)?;
            self.finalize(&mut payload, config)?;

            let close = payload.requires_fence_signal();
            self.batch.push(payload);
            if close {
                self.flush()?;
            }
        }

        if !self.batch.is_empty() {
            self.flush()?;
        }
        Ok(processed)
    }

    fn gather_waits(&mut self, payload: &Payload) {
        for sync_point in &payload.sync_points_to_wait {
            let Some(resolution) = sync_point.resolution() else {
                continue;
            };
            // work on the same queue is already ordered
            if Arc::ptr_eq(&resolution.fence, self.queue.fence()) {
                continue;
            }
            if resolution.fence.cached_completed_value() >= resolution.value {
                continue;
            }
            match self
                .batch
                .fence_waits
                .iter_mut()
                .find(|(fence, _)| Arc::ptr_eq(fence, &resolution.fence))
            {
                Some((_, value)) => *value = (*value).max(resolution.value),
                None => self.batch.fence_waits.push((resolution.fence.clone(), resolution.value)),
            }
        }
        self.batch.manual_waits.extend(payload.manual_fence_waits.iter().cloned());
    }

    fn gather_queries(&mut self, payload: &mut Payload, config: &Config) -> Result<(), HalError> {
        if config.submission.collect_timing && !payload.command_lists.is_empty() {
            let allocator = self.timing_queries.get_or_insert_with(|| self.queue.query_allocator());
            let begin = allocator.allocate_internal(QueryType::Timestamp)?;
            let end = allocator.allocate_internal(QueryType::Timestamp)?;
            let mut commands = self.queue.acquire_command_allocator()?;
            let begin_list = commands.record_timestamp(begin.heap().raw(), begin.index())?;
            let end_list = commands.record_timestamp(end.heap().raw(), end.index())?;
            payload.command_lists.insert(0, begin_list);
            payload.command_lists.push(end_list);
            payload.cleanup.push(Cleanup::CommandAllocator(commands));
            self.queries.append(allocator.close());
            self.timing.push(TimingPair { begin, end });
        }
        self.queries.append(mem::take(&mut payload.queries));
        Ok(())
    }

    fn finalize(&mut self, payload: &mut Payload, config: &Config) -> Result<(), HalError> {
        assert!(
            payload.completion_fence_value.is_none(),
            "payload {} was enqueued twice",
            payload.serial
        );

        let resolve = !self.queries.is_empty()
            && (payload.signals_cpu_sync_point()
                || self.pending.is_empty()
                || self.queries.len() >= config.queries.max_pending_queries);
        if resolve {
            self.record_resolve(payload)?;
        }

        let fence = self.queue.fence();
        let value = fence.allocate_value();
        for sync_point in &payload.sync_points_to_signal {
            sync_point.resolve(fence, value);
        }
        payload.completion_fence_value = Some(value);
        trace!(queue = %self.queue.name(), payload = payload.serial, value, "finalized payload");
        Ok(())
    }

    fn record_resolve(&mut self, payload: &mut Payload) -> Result<(), HalError> {
        let batch = mem::take(&mut self.queries);
        let runs = coalesce_ranges(batch.ranges);
        let mut commands = self.queue.acquire_command_allocator()?;
        let raw_runs: Vec<(&dyn HardwareQueryHeap, Range<u32>)> =
            runs.iter().map(|run| (run.heap.raw(), run.range.clone())).collect();
        let command_list = commands.record_query_resolve(&raw_runs)?;
        drop(raw_runs);

        debug!(
            queue = %self.queue.name(),
            payload = payload.serial,
            queries = batch.queries.len(),
            runs = runs.len(),
            "recorded query resolve"
        );
        payload.command_lists.push(command_list);
        payload.cleanup.push(Cleanup::CommandAllocator(commands));
        payload.resolve = Some(ResolveBatch {
            queries: batch.queries,
            runs,
            timing: mem::take(&mut self.timing),
        });
        Ok(())
    }

    /// Issues the current batch and hands its payloads to the interrupt engine.
    fn flush(&mut self) -> Result<(), HalError> {
        let batch = mem::take(&mut self.batch);
        let Some(tail) = batch.payloads.last().and_then(|payload| payload.completion_fence_value) else {
            return Ok(());
        };
        let issued = self.issue(&batch, tail);

        let now = Instant::now();
        let count = batch.payloads.len();
        self.counters.in_flight.fetch_add(count, Ordering::AcqRel);
        self.counters.pending.fetch_sub(count, Ordering::AcqRel);
        self.counters.submitted.fetch_add(count as u64, Ordering::Relaxed);
        for mut payload in batch.payloads {
            payload.submission_time = Some(now);
            payload.submitted.store(true, Ordering::Release);
            // the queue owns both ends of the channel
            let _ = self.queue.interrupt_sender.send(payload);
        }
        issued
    }

    fn issue(&self, batch: &Batch, tail: u64) -> Result<(), HalError> {
        let hal = self.queue.hal();
        let fence = self.queue.fence();
        for (wait_fence, value) in &batch.fence_waits {
            hal.wait(wait_fence.hal().as_ref(), *value)?;
        }
        for (manual_fence, value) in &batch.manual_waits {
            hal.wait(manual_fence.hal().as_ref(), *value)?;
        }
        if !batch.commits.is_empty() {
            hal.update_reserved_resources(&batch.commits)?;
        }
        if !batch.command_lists.is_empty() {
            hal.execute(&batch.command_lists)?;
        }
        hal.signal(fence.hal().as_ref(), tail)?;
        fence.mark_signaled(tail);
        for (manual_fence, value) in &batch.manual_signals {
            hal.signal(manual_fence.hal().as_ref(), *value)?;
        }
        debug!(
            queue = %self.queue.name(),
            payloads = batch.payloads.len(),
            command_lists = batch.command_lists.len(),
            waits = batch.fence_waits.len() + batch.manual_waits.len(),
            value = tail,
            "submitted batch"
        );
        Ok(())
    }
}

/// State owned by whichever thread runs the submission engine.
pub(crate) struct SubmissionContext {
    queues: Vec<QueueState>,
}

impl SubmissionContext {
    pub(crate) fn new(queues: &[Arc<Queue>], counters: &Arc<Counters>) -> SubmissionContext {
        SubmissionContext {
            queues: queues
                .iter()
                .map(|queue| QueueState {
                    queue: queue.clone(),
                    counters: counters.clone(),
                    pending: VecDeque::new(),
                    queries: QueryBatch::default(),
                    timing: Vec::new(),
                    timing_queries: None,
                    batch: Batch::default(),
                })
                .collect(),
        }
    }

    /// Runs until an iteration makes no progress. Returns the number of payloads submitted.
    pub(crate) fn drain(&mut self, incoming: &Receiver<Box<Payload>>, config: &Config) -> Result<usize, HalError> {
        let _span = trace_span!("drain submissions").entered();
        let mut submitted = 0;
        loop {
            let mut progress = false;
            for payload in incoming.try_iter() {
                let index = payload.queue.index();
                self.queues[index].pending.push_back(payload);
                progress = true;
            }
            for state in &mut self.queues {
                let processed = state.process(config)?;
                if processed > 0 {
                    progress = true;
                    submitted += processed;
                }
            }
            if !progress {
                break;
            }
        }
        Ok(submitted)
    }

    /// Payloads waiting for submission, per queue index.
    pub(crate) fn pending_counts(&self) -> Vec<usize> {
        self.queues.iter().map(|state| state.pending.len()).collect()
    }

    pub(crate) fn pending_total(&self) -> usize {
        self.queues.iter().map(|state| state.pending.len()).sum()
    }
}
