//! Interrupt engine.
//!
//! Retires submitted payloads in completion order: reads back their queries, fires the events
//! of the sync points they signal and releases their resources. Also watches for payloads that
//! stop making progress and for removed devices.
use crate::{
    diagnostics::{CrashReport, HangReport, PayloadReport, QueueReport},
    engine::Shared,
    fence::Fence,
    hal::DEVICE_REMOVED_FENCE_VALUE,
    payload::{Cleanup, Payload},
    queue::Queue,
};
use std::{
    collections::VecDeque,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use tracing::{trace, warn};

/// Time a payload has spent signaled but not completed.
#[derive(Debug, Default)]
pub(crate) struct HangCheck {
    last_tick: Option<Instant>,
    elapsed: Duration,
    pub(crate) reported: bool,
}

impl HangCheck {
    pub(crate) fn is_started(&self) -> bool {
        self.last_tick.is_some()
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.last_tick = Some(now);
    }

    /// Accumulates the time since the previous observation, crediting at most `clamp` per call.
    ///
    /// Returns `None` until the check has been started.
    pub(crate) fn observe(&mut self, now: Instant, clamp: Option<Duration>) -> Option<Duration> {
        let last = self.last_tick?;
        let mut delta = now.saturating_duration_since(last);
        if let Some(clamp) = clamp {
            delta = delta.min(clamp);
        }
        self.elapsed += delta;
        self.last_tick = Some(now);
        Some(self.elapsed)
    }
}

/// A fence wait that would let the interrupt engine make progress.
pub(crate) struct WaitTarget {
    pub(crate) fence: Arc<Fence>,
    pub(crate) value: u64,
    pub(crate) timeout: Duration,
}

impl WaitTarget {
    pub(crate) fn wait(&self) -> bool {
        self.fence.wait(self.value, self.timeout)
    }
}

type RetireCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct PollResult {
    pub(crate) retired: usize,
    /// `None` when nothing is in flight or the device was lost.
    pub(crate) wait: Option<WaitTarget>,
    callbacks: Vec<RetireCallback>,
}

impl PollResult {
    /// Runs the `on_retire` callbacks of the retired payloads, then publishes the retirements.
    ///
    /// Must be called after the interrupt context is released: callbacks may drive the engine.
    pub(crate) fn finish(mut self, shared: &Shared) -> PollResult {
        for callback in self.callbacks.drain(..) {
            callback();
        }
        if self.retired > 0 {
            shared.counters.in_flight.fetch_sub(self.retired, Ordering::AcqRel);
            shared.counters.retired.fetch_add(self.retired as u64, Ordering::Relaxed);
        }
        self
    }
}

struct QueueState {
    queue: Arc<Queue>,
    in_flight: VecDeque<Box<Payload>>,
}

/// State owned by whichever thread currently runs the interrupt engine.
pub(crate) struct InterruptContext {
    queues: Vec<QueueState>,
}

impl InterruptContext {
    pub(crate) fn new(queues: &[Arc<Queue>]) -> InterruptContext {
        InterruptContext {
            queues: queues
                .iter()
                .map(|queue| QueueState {
                    queue: queue.clone(),
                    in_flight: VecDeque::new(),
                })
                .collect(),
        }
    }

    /// Retires every completed payload without blocking.
    pub(crate) fn poll(&mut self, shared: &Shared) -> PollResult {
        shared.counters.polls.fetch_add(1, Ordering::Relaxed);
        let mut result = PollResult::default();
        self.collect_submitted();
        if shared.diagnostics.is_device_lost() {
            // nothing retires once the device is gone; polling only keeps the in-flight lists
            // current for `queue_reports`
            return result;
        }

        let config = &shared.config.interrupt;
        let now = Instant::now();
        let mut removed = None;
        let mut hangs = Vec::new();

        for state in &mut self.queues {
            if state.in_flight.is_empty() {
                continue;
            }

            let fence = state.queue.fence();
            let completed = fence.completed_value();
            if completed == DEVICE_REMOVED_FENCE_VALUE {
                removed = Some(format!("device removed (fence `{}` reports removal)", fence.name()));
                break;
            }

            while let Some(head) = state.in_flight.front_mut() {
                let target = head.completion_fence_value.unwrap_or(0);
                if completed >= target {
                    if let Some(payload) = state.in_flight.pop_front() {
                        retire(&state.queue, payload, &mut result.callbacks);
                        result.retired += 1;
                    }
                    continue;
                }

                if !head.hang_check.is_started() && fence.last_signaled_value() >= target {
                    head.hang_check.start(now);
                }
                let remaining = match head.hang_check.observe(now, config.hang_tick_clamp()) {
                    Some(elapsed) if elapsed >= config.hang_timeout() => {
                        if !head.hang_check.reported {
                            head.hang_check.reported = true;
                            hangs.push(HangReport {
                                queue: state.queue.id(),
                                name: state.queue.name().to_string(),
                                payload: PayloadReport::new(head, now),
                                elapsed,
                                queues: Vec::new(),
                            });
                        }
                        config.poll_interval()
                    }
                    Some(elapsed) => config.hang_timeout() - elapsed,
                    None => config.poll_interval(),
                };

                let timeout = remaining.min(config.poll_interval());
                if result.wait.as_ref().map_or(true, |wait| timeout < wait.timeout) {
                    result.wait = Some(WaitTarget {
                        fence: fence.clone(),
                        value: target,
                        timeout,
                    });
                }
                break;
            }
        }

        if !hangs.is_empty() {
            let queues = self.queue_reports(shared);
            for mut hang in hangs {
                hang.queues = queues.clone();
                shared.diagnostics.report_hang(hang);
            }
        }
        if let Some(reason) = removed.or_else(|| shared.diagnostics.take_pending_fatal()) {
            let report = self.crash_report(reason, shared);
            shared.diagnostics.report_device_lost(report);
            result.wait = None;
        }
        result
    }

    /// Moves the payloads handed over by the submission engine into the in-flight lists.
    fn collect_submitted(&mut self) {
        for state in &mut self.queues {
            state.in_flight.extend(state.queue.interrupt_receiver.try_iter());
        }
    }

    /// Snapshot of every queue and its in-flight payloads.
    pub(crate) fn queue_reports(&mut self, shared: &Shared) -> Vec<QueueReport> {
        self.collect_submitted();
        // the submission engine may be the one reporting
        let pending = shared.submission.try_lock().map(|context| context.pending_counts());
        let now = Instant::now();
        self.queues
            .iter()
            .map(|state| {
                let fence = state.queue.fence();
                QueueReport {
                    queue: state.queue.id(),
                    name: state.queue.name().to_string(),
                    completed_value: fence.completed_value(),
                    last_signaled_value: fence.last_signaled_value(),
                    next_completion_value: fence.next_completion_value(),
                    pending_submission: pending.as_ref().map(|counts| counts[state.queue.index()]),
                    in_flight: state.in_flight.iter().map(|payload| PayloadReport::new(payload, now)).collect(),
                }
            })
            .collect()
    }

    pub(crate) fn crash_report(&mut self, reason: String, shared: &Shared) -> CrashReport {
        CrashReport {
            reason,
            queues: self.queue_reports(shared),
        }
    }
}

fn retire(queue: &Queue, mut payload: Box<Payload>, callbacks: &mut Vec<RetireCallback>) {
    if let Some(resolve) = payload.resolve.take() {
        match resolve.read_back(queue.timestamp_frequency()) {
            Ok(sample) => queue.record_timing(sample),
            Err(err) => warn!(queue = %queue.name(), queries = resolve.query_count(), "failed to read back queries: {err}"),
        }
    }

    for sync_point in &payload.sync_points_to_signal {
        sync_point.complete();
    }

    for cleanup in payload.cleanup.drain(..) {
        match cleanup {
            Cleanup::CommandAllocator(allocator) => queue.release_command_allocator(allocator),
            Cleanup::QueryHeap(heap) => drop(heap),
            Cleanup::Object(object) => drop(object),
            Cleanup::Callback(callback) => callbacks.push(callback),
        }
    }

    trace!(
        queue = %queue.name(),
        payload = payload.serial,
        value = payload.completion_fence_value,
        "retired payload"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hang_check_accumulates_only_once_started() {
        let mut check = HangCheck::default();
        let t0 = Instant::now();
        assert_eq!(check.observe(t0, None), None);
        check.start(t0);
        assert_eq!(check.observe(t0 + Duration::from_millis(20), None), Some(Duration::from_millis(20)));
        assert_eq!(check.observe(t0 + Duration::from_millis(50), None), Some(Duration::from_millis(50)));
    }

    #[test]
    fn hang_check_clamps_each_tick() {
        let mut check = HangCheck::default();
        let t0 = Instant::now();
        check.start(t0);
        let clamp = Some(Duration::from_secs(1));
        // a long stall between two polls only counts for one clamp interval
        assert_eq!(check.observe(t0 + Duration::from_secs(30), clamp), Some(Duration::from_secs(1)));
        assert_eq!(
            check.observe(t0 + Duration::from_millis(30_500), clamp),
            Some(Duration::from_millis(1500))
        );
    }
}
