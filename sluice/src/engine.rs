use crate::{
    config::Config,
    diagnostics::{Diagnostics, GpuCrash, QueueReport},
    error::{DeviceLost, Error, HalError},
    fence::ManualFence,
    hal::{HardwareDevice, QueueKind},
    interrupt::InterruptContext,
    payload::Payload,
    queue::{Queue, QueueId, QueueTiming},
    submission::SubmissionContext,
    sync_point::{SyncPoint, SyncPointKind, SyncPointRef},
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, debug_span, error, info, warn};

/// Payload counts maintained by both engines.
#[derive(Default)]
pub(crate) struct Counters {
    /// Enqueued but not yet handed to the hardware.
    pub(crate) pending: AtomicUsize,
    /// Handed to the hardware but not yet retired.
    pub(crate) in_flight: AtomicUsize,
    pub(crate) submitted: AtomicU64,
    pub(crate) retired: AtomicU64,
    pub(crate) polls: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineStats {
    pub pending: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub retired: u64,
    pub interrupt_polls: u64,
}

/// GPU time spent by each queue since the previous call to `Engine::end_frame`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameTiming {
    pub queues: Vec<(QueueId, QueueTiming)>,
}

impl FrameTiming {
    pub fn queue(&self, id: QueueId) -> Option<&QueueTiming> {
        self.queues.iter().find(|(queue, _)| *queue == id).map(|(_, timing)| timing)
    }
}

struct Wake {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Wake {
    fn new() -> Wake {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        Wake { sender, receiver }
    }

    fn notify(&self) {
        // a pending notification is enough
        let _ = self.sender.try_send(());
    }
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) queues: Vec<Arc<Queue>>,
    devices: Vec<Arc<dyn HardwareDevice>>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) diagnostics: Diagnostics,
    incoming_sender: Sender<Box<Payload>>,
    incoming_receiver: Receiver<Box<Payload>>,
    pub(crate) submission: Mutex<SubmissionContext>,
    pub(crate) interrupt: Mutex<InterruptContext>,
    submission_wake: Wake,
    interrupt_wake: Wake,
    shutdown: AtomicBool,
}

impl Shared {
    fn run_submission(&self) {
        let result = {
            let mut context = self.submission.lock();
            context.drain(&self.incoming_receiver, &self.config)
        };
        match result {
            Ok(0) => {}
            Ok(_) => self.kick_interrupts(),
            Err(err) => self.handle_hal_error(err),
        }
    }

    fn kick_submission(&self) {
        if self.config.submission.dedicated_thread {
            self.submission_wake.notify();
        } else {
            self.run_submission();
        }
    }

    fn kick_interrupts(&self) {
        if self.config.interrupt.dedicated_thread {
            self.interrupt_wake.notify();
        } else {
            self.poll_interrupts();
        }
    }

    fn handle_hal_error(&self, err: HalError) {
        error!("hardware error during submission: {err}");
        self.diagnostics
            .set_pending_fatal(format!("hardware error during submission: {err}"));
        if self.config.interrupt.dedicated_thread {
            self.interrupt_wake.notify();
        } else {
            let result = self.interrupt.lock().poll(self);
            result.finish(self);
        }
    }

    /// Runs the interrupt engine once unless another thread is running it. Never blocks.
    pub(crate) fn poll_interrupts(&self) -> usize {
        match self.interrupt.try_lock().map(|mut context| context.poll(self)) {
            Some(result) => result.finish(self).retired,
            None => 0,
        }
    }

    /// Drives the engines until `sync_point` completes, the device is lost or `deadline` passes.
    pub(crate) fn wait_for_sync_point(&self, sync_point: &SyncPoint, deadline: Option<Instant>) -> Result<bool, DeviceLost> {
        let _span = debug_span!("wait for sync point", id = sync_point.id()).entered();
        let event = sync_point.event();
        let poll_interval = self.config.interrupt.poll_interval();
        loop {
            if event.is_set() {
                return Ok(true);
            }
            if self.diagnostics.is_device_lost() {
                return Err(DeviceLost);
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if deadline <= now => return Ok(false),
                Some(deadline) => (deadline - now).min(poll_interval),
                None => poll_interval,
            };

            if self.config.interrupt.dedicated_thread {
                event.wait_timeout(slice);
                continue;
            }
            // whoever holds the interrupt context retires payloads for everyone
            match self.interrupt.try_lock().map(|mut context| context.poll(self)) {
                Some(result) => match result.finish(self).wait {
                    Some(wait) => {
                        wait.fence.wait(wait.value, wait.timeout.min(slice));
                    }
                    None => {
                        event.wait_timeout(slice.min(Duration::from_millis(1)));
                    }
                },
                None => {
                    event.wait_timeout(slice.min(Duration::from_millis(1)));
                }
            }
        }
    }

    /// Returns `Ok(false)` if the deadline passed with payloads still in flight.
    fn drain(&self, deadline: Option<Instant>) -> Result<bool, DeviceLost> {
        let poll_interval = self.config.interrupt.poll_interval();
        loop {
            if self.diagnostics.is_device_lost() {
                return Err(DeviceLost);
            }
            self.kick_submission();

            let in_flight = self.counters.in_flight.load(Ordering::Acquire);
            let pending = self.counters.pending.load(Ordering::Acquire);
            if in_flight == 0 && pending == 0 {
                return Ok(true);
            }
            if in_flight == 0 {
                let context = self.submission.lock();
                let stalled = context.pending_total();
                if self.incoming_receiver.is_empty()
                    && stalled == self.counters.pending.load(Ordering::Acquire)
                    && self.counters.in_flight.load(Ordering::Acquire) == 0
                {
                    warn!(stalled, "payloads are waiting for sync points that are never signaled");
                    return Ok(true);
                }
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Ok(false);
            }

            if self.config.interrupt.dedicated_thread {
                std::thread::sleep(poll_interval.min(Duration::from_millis(1)));
                continue;
            }
            match self.interrupt.try_lock().map(|mut context| context.poll(self)) {
                Some(result) => {
                    if let Some(wait) = result.finish(self).wait {
                        wait.wait();
                    }
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

fn submission_thread(shared: Arc<Shared>) {
    let _span = debug_span!("submission thread").entered();
    let poll_interval = shared.config.interrupt.poll_interval();
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(RecvTimeoutError::Disconnected) = shared.submission_wake.receiver.recv_timeout(poll_interval) {
            break;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.run_submission();
    }
    debug!("submission thread exited");
}

fn interrupt_thread(shared: Arc<Shared>) {
    let _span = debug_span!("interrupt thread").entered();
    let poll_interval = shared.config.interrupt.poll_interval();
    while !shared.shutdown.load(Ordering::Acquire) {
        let result = shared.interrupt.lock().poll(&shared);
        match result.finish(&shared).wait {
            Some(wait) => {
                wait.wait();
            }
            None => {
                if let Err(RecvTimeoutError::Disconnected) = shared.interrupt_wake.receiver.recv_timeout(poll_interval) {
                    break;
                }
            }
        }
    }
    debug!("interrupt thread exited");
}

fn spawn(name: &str, shared: &Arc<Shared>, body: fn(Arc<Shared>)) -> Result<JoinHandle<()>, Error> {
    let shared = shared.clone();
    Ok(std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(shared))?)
}

/// Submits payloads to the queues of a set of devices and retires them as they complete.
pub struct Engine {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Creates an engine driving every queue exposed by `devices`.
    pub fn new(devices: Vec<Arc<dyn HardwareDevice>>, config: Config) -> Result<Engine, Error> {
        let mut queues = Vec::new();
        for (device_index, device) in devices.iter().enumerate() {
            let first = queues.len();
            for kind in QueueKind::ALL {
                if let Some(hal) = device.queue(kind) {
                    let id = QueueId {
                        device: device_index,
                        kind,
                    };
                    queues.push(Queue::new(id, queues.len(), device.clone(), hal, &config)?);
                }
            }
            if queues.len() == first {
                return Err(Error::NoQueues(device.name().to_string()));
            }
        }

        let counters = Arc::new(Counters::default());
        let (incoming_sender, incoming_receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            submission: Mutex::new(SubmissionContext::new(&queues, &counters)),
            interrupt: Mutex::new(InterruptContext::new(&queues)),
            diagnostics: Diagnostics::new(config.diagnostics.terminate_on_device_lost),
            counters,
            incoming_sender,
            incoming_receiver,
            submission_wake: Wake::new(),
            interrupt_wake: Wake::new(),
            shutdown: AtomicBool::new(false),
            devices,
            queues,
            config,
        });

        let mut engine = Engine {
            shared,
            threads: Vec::new(),
        };
        if engine.shared.config.submission.dedicated_thread {
            let thread = spawn("sluice-submission", &engine.shared, submission_thread)?;
            engine.threads.push(thread);
        }
        if engine.shared.config.interrupt.dedicated_thread {
            let thread = spawn("sluice-interrupt", &engine.shared, interrupt_thread)?;
            engine.threads.push(thread);
        }
        info!(
            devices = engine.shared.devices.len(),
            queues = engine.shared.queues.len(),
            dedicated_threads = engine.threads.len(),
            "engine started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn devices(&self) -> &[Arc<dyn HardwareDevice>] {
        &self.shared.devices
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.shared.queues
    }

    pub fn queue(&self, device: usize, kind: QueueKind) -> Option<&Arc<Queue>> {
        self.shared
            .queues
            .iter()
            .find(|queue| queue.id() == QueueId { device, kind })
    }

    pub fn create_payload(&self, queue: &Arc<Queue>) -> Payload {
        self.check_queue(queue);
        Payload::new(queue)
    }

    pub fn create_sync_point(&self, kind: SyncPointKind) -> SyncPointRef {
        SyncPoint::new(kind, None, Arc::downgrade(&self.shared))
    }

    pub fn create_named_sync_point(&self, kind: SyncPointKind, name: impl Into<String>) -> SyncPointRef {
        SyncPoint::new(kind, Some(name.into()), Arc::downgrade(&self.shared))
    }

    /// Creates a fence on `device` for explicit signals and waits.
    pub fn create_manual_fence(&self, device: usize, initial_value: u64) -> Result<ManualFence, HalError> {
        let device = self
            .shared
            .devices
            .get(device)
            .ok_or(HalError::Unsupported("no such device"))?;
        Ok(ManualFence::new(device.create_fence(initial_value)?))
    }

    fn check_queue(&self, queue: &Arc<Queue>) {
        let owned = self
            .shared
            .queues
            .get(queue.index())
            .map_or(false, |candidate| Arc::ptr_eq(candidate, queue));
        assert!(owned, "queue `{}` belongs to another engine", queue.name());
    }

    /// Hands a payload to the submission engine.
    pub fn enqueue(&self, payload: Payload) {
        self.check_queue(&payload.queue);
        if self.is_device_lost() {
            warn!(payload = payload.serial, "device lost, dropping payload");
            return;
        }
        self.shared.counters.pending.fetch_add(1, Ordering::AcqRel);
        // the engine owns both ends of the channel
        let _ = self.shared.incoming_sender.send(Box::new(payload));
        self.shared.kick_submission();
    }

    /// Enqueues several payloads, then runs the submission engine once.
    pub fn submit(&self, payloads: impl IntoIterator<Item = Payload>) {
        let lost = self.is_device_lost();
        for payload in payloads {
            self.check_queue(&payload.queue);
            if lost {
                warn!(payload = payload.serial, "device lost, dropping payload");
                continue;
            }
            self.shared.counters.pending.fetch_add(1, Ordering::AcqRel);
            let _ = self.shared.incoming_sender.send(Box::new(payload));
        }
        self.shared.kick_submission();
    }

    /// Submits every payload whose dependencies are resolved.
    pub fn flush(&self) {
        self.shared.kick_submission();
    }

    /// Blocks until every submitted payload has retired.
    ///
    /// Payloads waiting for sync points that no enqueued payload signals are left pending.
    pub fn drain_until_idle(&self) -> Result<(), DeviceLost> {
        self.shared.drain(None).map(|_| ())
    }

    /// Retires completed payloads without blocking. Returns the number of payloads retired.
    pub fn process_interrupts(&self) -> usize {
        self.shared.poll_interrupts()
    }

    /// Snapshot of every queue: fence values and the payloads handed to the hardware that have
    /// not retired yet. Remains available after a device loss.
    ///
    /// Blocks while another thread runs the interrupt engine, so it must not be called from the
    /// crash handler.
    pub fn queue_reports(&self) -> Vec<QueueReport> {
        let mut context = self.shared.interrupt.lock();
        context.queue_reports(&self.shared)
    }

    /// Registers the callback receiving hang and device-lost reports.
    pub fn set_crash_handler(&self, handler: impl Fn(&GpuCrash) + Send + Sync + 'static) {
        self.shared.diagnostics.set_handler(Arc::new(handler));
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.diagnostics.is_device_lost()
    }

    /// Returns and resets the GPU time accumulated by each queue.
    pub fn end_frame(&self) -> FrameTiming {
        FrameTiming {
            queues: self
                .shared
                .queues
                .iter()
                .map(|queue| (queue.id(), queue.take_timing()))
                .collect(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            pending: counters.pending.load(Ordering::Acquire),
            in_flight: counters.in_flight.load(Ordering::Acquire),
            submitted: counters.submitted.load(Ordering::Relaxed),
            retired: counters.retired.load(Ordering::Relaxed),
            interrupt_polls: counters.polls.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_device_lost() {
            let deadline = Instant::now() + self.shared.config.diagnostics.shutdown_timeout();
            match self.shared.drain(Some(deadline)) {
                Ok(true) => {}
                Ok(false) => warn!(
                    in_flight = self.shared.counters.in_flight.load(Ordering::Acquire),
                    "timed out waiting for in-flight payloads"
                ),
                Err(DeviceLost) => warn!("device lost during shutdown"),
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.submission_wake.notify();
        self.shared.interrupt_wake.notify();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("engine thread panicked");
            }
        }

        // payloads hold their queue; release the ones still queued for retirement
        for queue in &self.shared.queues {
            for payload in queue.interrupt_receiver.try_iter() {
                drop(payload);
            }
        }
        debug!("engine stopped");
    }
}
