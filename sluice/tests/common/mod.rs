#![allow(dead_code)]

use sluice::{
    hal::{
        emulated::{EmulatedAdapter, EmulatedDevice, EmulatedFence, EmulatedFenceId, ExecutionEvent, ExecutionRecord},
        HardwareDevice, QueueKind,
    },
    Config, Engine, Queue,
};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Default configuration that reports device loss instead of aborting the test process.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.diagnostics.terminate_on_device_lost = false;
    config
}

pub struct Setup {
    pub adapter: EmulatedAdapter,
    pub devices: Vec<Arc<EmulatedDevice>>,
    pub engine: Engine,
}

impl Setup {
    pub fn new(config: Config, devices: &[(&str, &[QueueKind])]) -> Setup {
        init_tracing();
        let adapter = EmulatedAdapter::new();
        let devices: Vec<_> = devices
            .iter()
            .map(|(name, kinds)| adapter.create_device(name, kinds))
            .collect();
        let hal_devices: Vec<Arc<dyn HardwareDevice>> = devices
            .iter()
            .map(|device| device.clone() as Arc<dyn HardwareDevice>)
            .collect();
        let engine = Engine::new(hal_devices, config).unwrap();
        Setup {
            adapter,
            devices,
            engine,
        }
    }

    /// A single device exposing the direct and compute queues.
    pub fn single(config: Config) -> Setup {
        Setup::new(config, &[("gpu", &[QueueKind::Direct, QueueKind::Compute])])
    }

    pub fn device(&self) -> &Arc<EmulatedDevice> {
        &self.devices[0]
    }

    pub fn queue(&self, device: usize, kind: QueueKind) -> Arc<Queue> {
        self.engine.queue(device, kind).unwrap().clone()
    }

    /// Operations retired by one queue.
    pub fn events(&self, device: usize, kind: QueueKind) -> Vec<ExecutionEvent> {
        self.adapter
            .execution_log()
            .into_iter()
            .filter(|record| record.device == device && record.queue == kind)
            .map(|record| record.event)
            .collect()
    }

    pub fn log(&self) -> Vec<ExecutionRecord> {
        self.adapter.execution_log()
    }
}

pub fn fence_id(queue: &Queue) -> EmulatedFenceId {
    queue
        .fence()
        .hal()
        .as_any()
        .downcast_ref::<EmulatedFence>()
        .unwrap()
        .id()
}

pub fn position(log: &[ExecutionRecord], device: usize, kind: QueueKind, event: &ExecutionEvent) -> usize {
    log.iter()
        .position(|record| record.device == device && record.queue == kind && record.event == *event)
        .unwrap_or_else(|| panic!("{event:?} not found in the execution log"))
}
