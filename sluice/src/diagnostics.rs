//! GPU crash and hang reporting.
use crate::{
    hal::DEVICE_REMOVED_FENCE_VALUE,
    payload::{Payload, PayloadWork},
    queue::QueueId,
    sync_point::SyncPointRef,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::error;

/// Callback invoked when a hang or a device loss is detected.
pub type CrashHandler = dyn Fn(&GpuCrash) + Send + Sync;

#[derive(Clone, Debug)]
pub enum GpuCrash {
    /// A payload has been signaled but has not completed within the hang timeout.
    Hang(HangReport),
    DeviceLost(CrashReport),
}

/// A sync point a payload waits on or signals.
#[derive(Clone, Debug)]
pub struct DependencyReport {
    pub sync_point: u64,
    pub name: Option<String>,
    /// Name of the fence and value the sync point resolved to.
    pub resolved: Option<(String, u64)>,
}

impl DependencyReport {
    fn new(sync_point: &SyncPointRef) -> DependencyReport {
        DependencyReport {
            sync_point: sync_point.id(),
            name: sync_point.name().map(str::to_string),
            resolved: sync_point.resolved_value().map(|(fence, value)| (fence.to_string(), value)),
        }
    }
}

impl fmt::Display for DependencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.sync_point)?;
        if let Some(name) = &self.name {
            write!(f, " \"{name}\"")?;
        }
        match &self.resolved {
            Some((fence, value)) => write!(f, " @ {fence}={value}"),
            None => f.write_str(" (unresolved)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PayloadReport {
    pub serial: u64,
    pub label: Option<String>,
    pub work: PayloadWork,
    pub completion_fence_value: Option<u64>,
    /// Time since the payload was handed to the hardware.
    pub age: Option<Duration>,
    pub command_lists: usize,
    pub waits: Vec<DependencyReport>,
    pub signals: Vec<DependencyReport>,
    pub hang_reported: bool,
}

impl PayloadReport {
    pub(crate) fn new(payload: &Payload, now: Instant) -> PayloadReport {
        PayloadReport {
            serial: payload.serial,
            label: payload.label.clone(),
            work: payload.work(),
            completion_fence_value: payload.completion_fence_value,
            age: payload.submission_time.map(|time| now.saturating_duration_since(time)),
            command_lists: payload.command_lists.len(),
            waits: payload.sync_points_to_wait.iter().map(DependencyReport::new).collect(),
            signals: payload.sync_points_to_signal.iter().map(DependencyReport::new).collect(),
            hang_reported: payload.hang_check.reported,
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[DependencyReport]) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

impl fmt::Display for PayloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload {}", self.serial)?;
        if let Some(label) = &self.label {
            write!(f, " \"{label}\"")?;
        }
        match self.completion_fence_value {
            Some(value) => write!(f, ", fence value {value}")?,
            None => f.write_str(", not finalized")?,
        }
        if let Some(age) = self.age {
            write!(f, ", submitted {:.1} ms ago", age.as_secs_f64() * 1000.0)?;
        }
        write!(f, ", {} command lists, waits ", self.command_lists)?;
        write_list(f, &self.waits)?;
        f.write_str(", signals ")?;
        write_list(f, &self.signals)?;
        if self.hang_reported {
            f.write_str(" [HUNG]")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct QueueReport {
    pub queue: QueueId,
    pub name: String,
    pub completed_value: u64,
    pub last_signaled_value: u64,
    pub next_completion_value: u64,
    /// `None` if the submission engine was busy when the report was built.
    pub pending_submission: Option<usize>,
    pub in_flight: Vec<PayloadReport>,
}

impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue {} ({}): completed ", self.name, self.queue)?;
        if self.completed_value == DEVICE_REMOVED_FENCE_VALUE {
            f.write_str("<removed>")?;
        } else {
            write!(f, "{}", self.completed_value)?;
        }
        write!(
            f,
            ", signaled {}, next {}, pending submission ",
            self.last_signaled_value, self.next_completion_value
        )?;
        match self.pending_submission {
            Some(count) => writeln!(f, "{count}")?,
            None => writeln!(f, "<unknown>")?,
        }
        for payload in &self.in_flight {
            writeln!(f, "    {payload}")?;
        }
        Ok(())
    }
}

/// State of every queue at the time a device loss was detected.
#[derive(Clone, Debug)]
pub struct CrashReport {
    pub reason: String,
    pub queues: Vec<QueueReport>,
}

impl CrashReport {
    pub fn in_flight_count(&self) -> usize {
        self.queues.iter().map(|queue| queue.in_flight.len()).sum()
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GPU crash: {}", self.reason)?;
        for queue in &self.queues {
            write!(f, "  {queue}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HangReport {
    pub queue: QueueId,
    pub name: String,
    pub payload: PayloadReport,
    /// Accumulated time the payload has been signaled without completing.
    pub elapsed: Duration,
    /// State of every queue when the hang was detected.
    pub queues: Vec<QueueReport>,
}

impl fmt::Display for HangReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "queue {} has not progressed for {:.1} s: {}",
            self.name,
            self.elapsed.as_secs_f64(),
            self.payload
        )?;
        for queue in &self.queues {
            write!(f, "  {queue}")?;
        }
        Ok(())
    }
}

pub(crate) struct Diagnostics {
    terminate_on_device_lost: bool,
    handler: RwLock<Option<Arc<CrashHandler>>>,
    device_lost: AtomicBool,
    /// Held for the duration of a device-lost report; later reporters find it set.
    reported: Mutex<bool>,
    pending_fatal: Mutex<Option<String>>,
}

impl Diagnostics {
    pub(crate) fn new(terminate_on_device_lost: bool) -> Diagnostics {
        Diagnostics {
            terminate_on_device_lost,
            handler: RwLock::new(None),
            device_lost: AtomicBool::new(false),
            reported: Mutex::new(false),
            pending_fatal: Mutex::new(None),
        }
    }

    pub(crate) fn set_handler(&self, handler: Arc<CrashHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Records a fatal error detected outside of the interrupt engine, which builds the report.
    pub(crate) fn set_pending_fatal(&self, reason: String) {
        self.pending_fatal.lock().get_or_insert(reason);
    }

    pub(crate) fn take_pending_fatal(&self) -> Option<String> {
        self.pending_fatal.lock().take()
    }

    fn notify(&self, crash: &GpuCrash) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(crash);
        }
    }

    pub(crate) fn report_hang(&self, report: HangReport) {
        error!("GPU hang detected: {report}");
        self.notify(&GpuCrash::Hang(report));
    }

    /// Delivers a device-lost report. Only the first report is delivered.
    pub(crate) fn report_device_lost(&self, report: CrashReport) {
        let mut reported = self.reported.lock();
        self.device_lost.store(true, Ordering::Release);
        if *reported {
            return;
        }
        *reported = true;

        error!("{report}");
        self.notify(&GpuCrash::DeviceLost(report));
        if self.terminate_on_device_lost {
            error!("terminating the process after GPU crash");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueueKind;
    use std::sync::atomic::AtomicUsize;

    fn report(reason: &str) -> CrashReport {
        CrashReport {
            reason: reason.into(),
            queues: vec![QueueReport {
                queue: QueueId {
                    device: 0,
                    kind: QueueKind::Direct,
                },
                name: "gpu/direct".into(),
                completed_value: DEVICE_REMOVED_FENCE_VALUE,
                last_signaled_value: 4,
                next_completion_value: 5,
                pending_submission: Some(2),
                in_flight: vec![PayloadReport {
                    serial: 17,
                    label: Some("shadows".into()),
                    work: PayloadWork::COMMAND_LISTS | PayloadWork::SIGNAL,
                    completion_fence_value: Some(4),
                    age: Some(Duration::from_millis(12)),
                    command_lists: 3,
                    waits: vec![],
                    signals: vec![DependencyReport {
                        sync_point: 9,
                        name: None,
                        resolved: Some(("gpu/direct".into(), 4)),
                    }],
                    hang_reported: false,
                }],
            }],
        }
    }

    #[test]
    fn first_device_lost_report_wins() {
        let diagnostics = Diagnostics::new(false);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        diagnostics.set_handler(Arc::new(move |crash: &GpuCrash| {
            assert!(matches!(crash, GpuCrash::DeviceLost(report) if report.reason == "first"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        diagnostics.report_device_lost(report("first"));
        diagnostics.report_device_lost(report("second"));
        assert!(diagnostics.is_device_lost());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn report_lists_in_flight_payloads() {
        let text = report("device removed").to_string();
        assert!(text.contains("GPU crash: device removed"));
        assert!(text.contains("completed <removed>, signaled 4, next 5, pending submission 2"));
        assert!(text.contains("payload 17 \"shadows\", fence value 4"));
        assert!(text.contains("signals [#9 @ gpu/direct=4]"));
    }

    #[test]
    fn hang_report_includes_every_queue() {
        let crash = report("unused");
        let hang = HangReport {
            queue: crash.queues[0].queue,
            name: "gpu/direct".into(),
            payload: crash.queues[0].in_flight[0].clone(),
            elapsed: Duration::from_secs(3),
            queues: crash.queues,
        };
        let text = hang.to_string();
        assert!(text.starts_with("queue gpu/direct has not progressed for 3.0 s: payload 17"));
        assert!(text.contains("  queue gpu/direct ("));
        assert!(text.contains("    payload 17 \"shadows\""));
    }

    #[test]
    fn pending_fatal_keeps_first_reason() {
        let diagnostics = Diagnostics::new(false);
        diagnostics.set_pending_fatal("submit failed".into());
        diagnostics.set_pending_fatal("another".into());
        assert_eq!(diagnostics.take_pending_fatal().as_deref(), Some("submit failed"));
        assert_eq!(diagnostics.take_pending_fatal(), None);
    }
}
