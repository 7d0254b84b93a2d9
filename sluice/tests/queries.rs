mod common;

use common::{test_config, Setup};
use sluice::{
    hal::{emulated::EmulatedCommand, PipelineStatisticsFlags, QueryType, QueueKind},
    PipelineStatistics, QueryResult, QueryValue, SyncPointKind, TimestampUnit,
};
use std::{collections::HashSet, time::Duration};

#[test]
fn results_are_delivered_across_heaps() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Direct);
    assert_eq!(engine.config().queries.heap_capacity, 256);

    let mut allocator = queue.query_allocator();
    let mut results = Vec::new();
    let mut commands = Vec::new();
    let mut heaps = HashSet::new();
    for i in 0..1000u64 {
        let result = QueryResult::new();
        let location = allocator.allocate(QueryType::Occlusion, result.clone()).unwrap();
        heaps.insert(location.heap().id());
        commands.push(EmulatedCommand::occlusion(&location, i * 3));
        results.push(result);
    }
    assert_eq!(heaps.len(), 4);
    assert_eq!(allocator.len(), 1000);

    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    let mut payload = engine.create_payload(&queue);
    payload
        .push_command_list(device.record(commands))
        .add_queries(allocator.close())
        .signal(&done);
    assert!(allocator.is_empty());
    engine.enqueue(payload);

    done.wait().unwrap();
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.get(), Some(QueryValue::Occlusion(i as u64 * 3)), "query {i}");
    }
}

#[test]
fn statistics_and_timestamps() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Compute);

    let statistics = PipelineStatistics {
        compute_shader_invocations: 4096,
        ..Default::default()
    };
    let mut allocator = queue.query_allocator();
    let stats_result = QueryResult::new();
    let begin = QueryResult::with_unit(TimestampUnit::Ticks);
    let end = QueryResult::with_unit(TimestampUnit::Ticks);
    let stats_location = allocator
        .allocate(QueryType::PipelineStatistics, stats_result.clone())
        .unwrap();
    let begin_location = allocator.allocate(QueryType::Timestamp, begin.clone()).unwrap();
    let end_location = allocator.allocate(QueryType::Timestamp, end.clone()).unwrap();

    let list = device.record([
        EmulatedCommand::write_timestamp(&begin_location),
        EmulatedCommand::pipeline_statistics(&stats_location, statistics),
        EmulatedCommand::Work { ticks: 500 },
        EmulatedCommand::write_timestamp(&end_location),
    ]);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    let mut payload = engine.create_payload(&queue);
    payload
        .push_command_list(list)
        .add_queries(allocator.close())
        .signal(&done);
    engine.enqueue(payload);
    done.wait().unwrap();

    match stats_result.get() {
        Some(QueryValue::PipelineStatistics(resolved)) => {
            assert_eq!(resolved, statistics);
            assert_eq!(resolved.get(PipelineStatisticsFlags::COMPUTE_SHADER_INVOCATIONS), Some(4096));
        }
        other => panic!("unexpected statistics result {other:?}"),
    }
    match (begin.get(), end.get()) {
        (Some(QueryValue::Timestamp(begin)), Some(QueryValue::Timestamp(end))) => assert_eq!(end - begin, 500),
        other => panic!("unexpected timestamps {other:?}"),
    }
}

#[test]
fn queries_of_gpu_only_payloads_wait_for_a_resolve() {
    let setup = Setup::single(test_config());
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Direct);

    let mut allocator = queue.query_allocator();
    let early = QueryResult::new();
    let location = allocator.allocate(QueryType::Occlusion, early.clone()).unwrap();

    // a GPU-only signal followed by more payloads: resolution is deferred to the last one
    let intermediate = engine.create_sync_point(SyncPointKind::GpuOnly);
    let done = engine.create_sync_point(SyncPointKind::GpuAndCpu);
    let mut first = engine.create_payload(&queue);
    first
        .push_command_list(device.record([EmulatedCommand::occlusion(&location, 11)]))
        .add_queries(allocator.close())
        .signal(&intermediate);
    let mut second = engine.create_payload(&queue);
    second
        .push_command_list(device.record([EmulatedCommand::Work { ticks: 1 }]))
        .signal(&done);
    engine.submit([first, second]);

    done.wait().unwrap();
    assert_eq!(early.get(), Some(QueryValue::Occlusion(11)));
}

#[test]
fn frame_timing_measures_busy_time() {
    let mut config = test_config();
    config.submission.collect_timing = true;
    let setup = Setup::single(config);
    let engine = &setup.engine;
    let device = setup.device();
    let queue = setup.queue(0, QueueKind::Direct);
    assert_eq!(queue.timestamp_frequency(), 10_000_000);

    for _ in 0..3 {
        let mut payload = engine.create_payload(&queue);
        payload.push_command_list(device.record([EmulatedCommand::Work { ticks: 100 }]));
        engine.enqueue(payload);
    }
    engine.drain_until_idle().unwrap();

    let frame = engine.end_frame();
    let timing = frame.queue(queue.id()).unwrap();
    assert_eq!(timing.payloads, 3);
    // each payload spans its own list plus the end timestamp list: 102 ticks at 10 MHz
    assert_eq!(timing.busy, Duration::from_nanos(3 * 10_200));

    let idle = engine.end_frame();
    assert_eq!(idle.queue(queue.id()).unwrap().payloads, 0);
    assert_eq!(idle.queue(setup.queue(0, QueueKind::Compute).id()).unwrap().busy, Duration::ZERO);
}
