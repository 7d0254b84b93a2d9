mod common;

use common::{fence_id, position, test_config, Setup};
use parking_lot::Mutex;
use sluice::{
    hal::{
        emulated::{EmulatedCommand, ExecutionEvent},
        QueueKind, ReservedBinding, ReservedResourceCommit, ResourceHandle,
    },
    Config, SyncPointKind,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn work(ticks: u64) -> [EmulatedCommand; 1] {
    [EmulatedCommand::Work { ticks }]
}

#[test]
fn round_trip() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let queue = setup.queue(0, QueueKind::Direct);

    let done = engine.create_named_sync_point(SyncPointKind::GpuAndCpu, "frame");
    let mut payload = engine.create_payload(&queue);
    payload
        .set_label("frame")
        .push_command_list(setup.device().record(work(5)))
        .signal(&done);
    engine.enqueue(payload);

    done.wait().unwrap();
    assert!(done.is_complete());
    assert_eq!(done.resolved_value(), Some((queue.fence().name(), 1)));
    // waiting again returns immediately
    assert_eq!(done.wait_timeout(Duration::ZERO), Ok(true));

    engine.drain_until_idle().unwrap();
    let stats = engine.stats();
    assert_eq!((stats.submitted, stats.retired, stats.pending, stats.in_flight), (1, 1, 0, 0));
}

#[test]
fn cross_queue_wait_orders_execution() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let direct = setup.queue(0, QueueKind::Direct);
    let compute = setup.queue(0, QueueKind::Compute);

    let produced = engine.create_sync_point(SyncPointKind::GpuOnly);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    let list_a = device.record(work(10));
    let list_b = device.record(work(10));

    // the consumer is enqueued first and stays pending until its producer shows up
    let mut consumer = engine.create_payload(&compute);
    consumer.wait(&produced).push_command_list(list_b).signal(&done);
    engine.enqueue(consumer);
    assert_eq!(engine.stats().pending, 1);
    assert_eq!(engine.stats().submitted, 0);
    assert_eq!(device.pending_operations(QueueKind::Compute), 0);

    device.pause(QueueKind::Direct);
    let mut producer = engine.create_payload(&direct);
    producer.push_command_list(list_a).signal(&produced);
    engine.enqueue(producer);
    assert_eq!(engine.stats().pending, 0);
    assert!(produced.is_resolved());
    assert!(!done.wait_timeout(Duration::from_millis(20)).unwrap());

    device.resume(QueueKind::Direct);
    done.wait().unwrap();

    let log = setup.log();
    let direct_fence = fence_id(&direct);
    let executed_a = position(&log, 0, QueueKind::Direct, &ExecutionEvent::Execute { command_list: list_a });
    let signaled = position(
        &log,
        0,
        QueueKind::Direct,
        &ExecutionEvent::Signal {
            fence: direct_fence,
            value: 1,
        },
    );
    let waited = position(
        &log,
        0,
        QueueKind::Compute,
        &ExecutionEvent::Wait {
            fence: direct_fence,
            value: 1,
        },
    );
    let executed_b = position(&log, 0, QueueKind::Compute, &ExecutionEvent::Execute { command_list: list_b });
    assert!(executed_a < signaled);
    assert!(signaled < waited);
    assert!(waited < executed_b);
}

#[test]
fn completion_values_increase_per_payload() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let queue = setup.queue(0, QueueKind::Direct);

    let sync_points: Vec<_> = (0..3).map(|_| engine.create_sync_point(SyncPointKind::GpuOnly)).collect();
    for sync_point in &sync_points {
        let mut payload = engine.create_payload(&queue);
        payload.push_command_list(setup.device().record(work(1))).signal(sync_point);
        engine.enqueue(payload);
    }
    engine.drain_until_idle().unwrap();

    let values: Vec<_> = sync_points
        .iter()
        .map(|sync_point| sync_point.resolved_value().map(|(_, value)| value))
        .collect();
    assert_eq!(values, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(queue.fence().last_signaled_value(), 3);
    assert_eq!(queue.fence().completed_value(), 3);
    assert_eq!(queue.fence().next_completion_value(), 4);
}

#[test]
fn batches_are_split_at_the_configured_size() {
    let config = Config::from_toml_str(
        r#"
        [submission]
        max_batched_payloads = 4

        [diagnostics]
        terminate_on_device_lost = false
        "#,
    )
    .unwrap();
    let setup = Setup::single(config);
    let engine = &setup.engine;
    let queue = setup.queue(0, QueueKind::Direct);

    let payloads: Vec<_> = (0..10)
        .map(|_| {
            let mut payload = engine.create_payload(&queue);
            payload.push_command_list(setup.device().record(work(1)));
            payload
        })
        .collect();
    engine.submit(payloads);
    engine.drain_until_idle().unwrap();

    let fence = fence_id(&queue);
    let signals: Vec<_> = setup
        .events(0, QueueKind::Direct)
        .into_iter()
        .filter_map(|event| match event {
            ExecutionEvent::Signal { fence: signaled, value } if signaled == fence => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(signals, vec![4, 8, 10]);
    assert_eq!(engine.stats().retired, 10);
}

#[test]
fn independent_queues_complete_in_submission_order() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let kinds = [QueueKind::Direct, QueueKind::Compute];
    let retired = Arc::new(Mutex::new(Vec::new()));

    for kind in kinds {
        device.pause(kind);
    }
    let mut payloads = Vec::new();
    let mut lists = Vec::new();
    for i in 0..3 {
        for kind in kinds {
            let list = device.record(work(1));
            let order = retired.clone();
            let mut payload = engine.create_payload(&setup.queue(0, kind));
            payload
                .set_label(format!("{kind}.{i}"))
                .push_command_list(list)
                .on_retire(move || order.lock().push((kind, i)));
            payloads.push(payload);
            lists.push((kind, list));
        }
    }
    engine.submit(payloads);
    assert_eq!(engine.stats().in_flight, 6);

    // each payload owns the next value of its queue's fence
    for report in engine.queue_reports() {
        let values: Vec<_> = report
            .in_flight
            .iter()
            .map(|payload| payload.completion_fence_value)
            .collect();
        assert_eq!(values, vec![Some(1), Some(2), Some(3)], "{}", report.name);
        let labels: Vec<_> = report
            .in_flight
            .iter()
            .map(|payload| payload.label.clone().unwrap())
            .collect();
        let kind = report.queue.kind;
        assert_eq!(labels, vec![format!("{kind}.0"), format!("{kind}.1"), format!("{kind}.2")]);
        assert_eq!(report.next_completion_value, 4);
    }

    for kind in kinds {
        device.resume(kind);
    }
    engine.drain_until_idle().unwrap();
    assert_eq!(engine.stats().retired, 6);

    for kind in kinds {
        let executed: Vec<_> = setup
            .events(0, kind)
            .into_iter()
            .filter_map(|event| match event {
                ExecutionEvent::Execute { command_list } => Some(command_list),
                _ => None,
            })
            .collect();
        let submitted: Vec<_> = lists
            .iter()
            .filter(|(queue, _)| *queue == kind)
            .map(|(_, list)| *list)
            .collect();
        assert_eq!(executed, submitted);

        let order: Vec<_> = retired
            .lock()
            .iter()
            .filter(|(queue, _)| *queue == kind)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(setup.queue(0, kind).fence().completed_value(), 3);
    }
}

#[test]
fn same_queue_waits_are_elided_and_cross_queue_waits_merged() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let direct = setup.queue(0, QueueKind::Direct);
    let compute = setup.queue(0, QueueKind::Compute);

    let first = engine.create_sync_point(SyncPointKind::GpuOnly);
    let second = engine.create_sync_point(SyncPointKind::GpuOnly);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);

    device.pause(QueueKind::Direct);
    let mut a = engine.create_payload(&direct);
    a.push_command_list(device.record(work(1))).signal(&first);
    let mut b = engine.create_payload(&direct);
    b.wait(&first).push_command_list(device.record(work(1))).signal(&second);
    let mut c = engine.create_payload(&compute);
    c.wait(&first)
        .wait(&second)
        .push_command_list(device.record(work(1)))
        .signal(&done);
    engine.submit([a, b, c]);

    device.resume(QueueKind::Direct);
    done.wait().unwrap();

    let direct_waits = setup
        .events(0, QueueKind::Direct)
        .into_iter()
        .filter(|event| matches!(event, ExecutionEvent::Wait { .. }))
        .count();
    assert_eq!(direct_waits, 0);

    let compute_waits: Vec<_> = setup
        .events(0, QueueKind::Compute)
        .into_iter()
        .filter(|event| matches!(event, ExecutionEvent::Wait { .. }))
        .collect();
    assert_eq!(
        compute_waits,
        vec![ExecutionEvent::Wait {
            fence: fence_id(&direct),
            value: 2
        }]
    );
}

#[test]
fn reserved_resource_commits_precede_command_lists() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Direct);

    let first_list = device.record(work(1));
    let second_list = device.record(work(1));
    let resource = ResourceHandle(42);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);

    let mut first = engine.create_payload(&queue);
    first.push_command_list(first_list);
    let mut second = engine.create_payload(&queue);
    second
        .commit_reserved_resource(ReservedResourceCommit {
            resource,
            bindings: vec![ReservedBinding {
                resource_offset: 0,
                size: 65536,
                memory: Some(7),
                memory_offset: 0,
            }],
        })
        .push_command_list(second_list)
        .signal(&done);
    engine.submit([first, second]);
    done.wait().unwrap();

    let fence = fence_id(&queue);
    assert_eq!(
        setup.events(0, QueueKind::Direct),
        vec![
            ExecutionEvent::Execute { command_list: first_list },
            ExecutionEvent::Signal { fence, value: 1 },
            ExecutionEvent::Commit { resource },
            ExecutionEvent::Execute {
                command_list: second_list
            },
            ExecutionEvent::Signal { fence, value: 2 },
        ]
    );
}

#[test]
fn waits_across_devices() {
    let setup = Setup::new(
        test_config(),
        &[("gpu0", &[QueueKind::Direct]), ("gpu1", &[QueueKind::Copy])],
    );
    let engine = &setup.engine;
    let direct = setup.queue(0, QueueKind::Direct);
    let copy = setup.queue(1, QueueKind::Copy);

    let rendered = engine.create_sync_point(SyncPointKind::GpuOnly);
    let copied = engine.create_sync_point(SyncPointKind::GpuAndCpu);

    let mut download = engine.create_payload(&copy);
    download
        .wait(&rendered)
        .push_command_list(setup.devices[1].record(work(3)))
        .signal(&copied);
    let mut render = engine.create_payload(&direct);
    render
        .push_command_list(setup.devices[0].record(work(3)))
        .signal(&rendered);
    engine.submit([download, render]);
    copied.wait().unwrap();

    let waits: Vec<_> = setup
        .events(1, QueueKind::Copy)
        .into_iter()
        .filter(|event| matches!(event, ExecutionEvent::Wait { .. }))
        .collect();
    assert_eq!(
        waits,
        vec![ExecutionEvent::Wait {
            fence: fence_id(&direct),
            value: 1
        }]
    );
}

#[test]
fn manual_fences_order_work_across_queues() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let direct = setup.queue(0, QueueKind::Direct);
    let compute = setup.queue(0, QueueKind::Compute);

    let fence = engine.create_manual_fence(0, 0).unwrap();
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);

    let mut consumer = engine.create_payload(&compute);
    consumer
        .wait_manual_fence(&fence, 7)
        .push_command_list(device.record(work(1)))
        .signal(&done);
    engine.enqueue(consumer);
    // manual waits do not hold back submission, only execution
    assert_eq!(engine.stats().pending, 0);
    assert!(!done.wait_timeout(Duration::from_millis(20)).unwrap());

    let mut producer = engine.create_payload(&direct);
    producer
        .push_command_list(device.record(work(1)))
        .signal_manual_fence(&fence, 7);
    engine.enqueue(producer);

    done.wait().unwrap();
    assert_eq!(fence.completed_value(), 7);
    assert!(fence.wait(7, Duration::ZERO));
}

#[test]
fn unsatisfied_waits_stay_pending_until_signaled() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let queue = setup.queue(0, QueueKind::Direct);

    let never = engine.create_sync_point(SyncPointKind::GpuOnly);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    let mut blocked = engine.create_payload(&queue);
    blocked.wait(&never).signal(&done);
    engine.enqueue(blocked);

    // returns even though the payload can never be submitted
    engine.drain_until_idle().unwrap();
    assert_eq!(engine.stats().pending, 1);
    assert!(!done.is_resolved());

    let compute = setup.queue(0, QueueKind::Compute);
    let mut late = engine.create_payload(&compute);
    late.signal(&never);
    engine.enqueue(late);
    done.wait().unwrap();
    engine.drain_until_idle().unwrap();
    assert_eq!(engine.stats().pending, 0);
}

#[test]
fn retained_resources_are_released_at_retirement() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Direct);

    let buffer = Arc::new(vec![0u8; 16]);
    let retired = Arc::new(AtomicUsize::new(0));
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);

    let mut commands = queue.acquire_command_allocator().unwrap();
    let list = commands.allocate().unwrap();
    device.append(list, work(4));

    device.pause(QueueKind::Direct);
    let mut payload = engine.create_payload(&queue);
    let counter = retired.clone();
    payload
        .push_command_list(list)
        .retain_allocator(commands)
        .retain(buffer.clone())
        .on_retire(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .signal(&done);
    engine.enqueue(payload);
    assert_eq!(Arc::strong_count(&buffer), 2);
    assert_eq!(retired.load(Ordering::SeqCst), 0);

    device.resume(QueueKind::Direct);
    done.wait().unwrap();
    engine.drain_until_idle().unwrap();
    assert_eq!(Arc::strong_count(&buffer), 1);
    assert_eq!(retired.load(Ordering::SeqCst), 1);

    // the recycled allocator hands out lists again
    let mut commands = queue.acquire_command_allocator().unwrap();
    assert!(commands.allocate().is_ok());
}

#[test]
fn retire_callbacks_can_wait_on_the_engine() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device().clone();

    let uploaded = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    device.pause(QueueKind::Compute);
    let mut upload = engine.create_payload(&setup.queue(0, QueueKind::Compute));
    upload.push_command_list(device.record(work(1))).signal(&uploaded);
    engine.enqueue(upload);

    // the callback runs while the compute payload is still in flight and has to retire it
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();
    let callback_device = device.clone();
    let mut render = engine.create_payload(&setup.queue(0, QueueKind::Direct));
    render
        .push_command_list(device.record(work(1)))
        .on_retire(move || {
            callback_device.resume(QueueKind::Compute);
            uploaded.wait().unwrap();
            flag.store(true, Ordering::SeqCst);
        });
    engine.enqueue(render);

    engine.drain_until_idle().unwrap();
    assert!(observed.load(Ordering::SeqCst));
    assert_eq!(engine.stats().retired, 2);
}

#[test]
fn concurrent_producers() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let retired = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for producer in 0..4 {
            let retired = retired.clone();
            let setup = &setup;
            scope.spawn(move || {
                let kind = if producer % 2 == 0 {
                    QueueKind::Direct
                } else {
                    QueueKind::Compute
                };
                let queue = setup.queue(0, kind);
                for _ in 0..25 {
                    let counter = retired.clone();
                    let mut payload = setup.engine.create_payload(&queue);
                    payload
                        .push_command_list(setup.device().record(work(1)))
                        .on_retire(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                    setup.engine.enqueue(payload);
                }
            });
        }
    });

    engine.drain_until_idle().unwrap();
    let stats = engine.stats();
    assert_eq!(stats.submitted, 100);
    assert_eq!(stats.retired, 100);
    assert_eq!((stats.pending, stats.in_flight), (0, 0));
    assert_eq!(retired.load(Ordering::SeqCst), 100);
}

#[test]
fn dedicated_threads() {
    let mut config = test_config();
    config.submission.dedicated_thread = true;
    config.interrupt.dedicated_thread = true;
    config.interrupt.poll_interval_ms = 2;
    let setup = Setup::single(config);
    let engine = &setup.engine;
    let queues = [setup.queue(0, QueueKind::Direct), setup.queue(0, QueueKind::Compute)];

    // a chain of payloads alternating between the two queues
    let mut previous = None;
    let mut last = None;
    for i in 0..20 {
        let kind = if i == 19 {
            SyncPointKind::GpuAndCpu
        } else {
            SyncPointKind::GpuOnly
        };
        let signaled = engine.create_sync_point(kind);
        let mut payload = engine.create_payload(&queues[i % 2]);
        if let Some(previous) = &previous {
            payload.wait(previous);
        }
        payload
            .push_command_list(setup.device().record(work(2)))
            .signal(&signaled);
        engine.enqueue(payload);
        previous = Some(signaled.clone());
        last = Some(signaled);
    }

    last.unwrap().wait().unwrap();
    engine.drain_until_idle().unwrap();
    assert_eq!(engine.stats().retired, 20);
}

#[test]
#[should_panic(expected = "GPU-only")]
fn gpu_only_sync_points_cannot_be_waited_on() {
    let setup = Setup::single(test_config());
    let sync_point = setup.engine.create_sync_point(SyncPointKind::GpuOnly);
    let _ = sync_point.wait();
}
