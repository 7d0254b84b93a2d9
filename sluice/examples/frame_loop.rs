//! Runs a few frames of a direct/compute/copy workload on the emulated backend.
//!
//! Usage: `cargo run --example frame_loop [config.toml]`. Set `RUST_LOG=sluice=debug` to see
//! the submission and interrupt engines at work.
use sluice::{
    hal::{
        emulated::{EmulatedAdapter, EmulatedCommand},
        HardwareDevice, QueryType, QueueKind,
    },
    Config, Engine, GpuCrash, QueryResult, QueryValue, SyncPointKind, TimestampUnit,
};
use std::sync::Arc;

const FRAMES: usize = 4;

fn main() -> Result<(), sluice::Error> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };
    config.submission.collect_timing = true;

    let adapter = EmulatedAdapter::new();
    let device = adapter.create_device("emulated", &[QueueKind::Direct, QueueKind::Compute, QueueKind::Copy]);
    let devices: Vec<Arc<dyn HardwareDevice>> = vec![device.clone()];
    let engine = Engine::new(devices, config)?;
    engine.set_crash_handler(|crash: &GpuCrash| match crash {
        GpuCrash::Hang(report) => eprintln!("{report}"),
        GpuCrash::DeviceLost(report) => eprintln!("{report}"),
    });

    let (Some(direct), Some(compute), Some(copy)) = (
        engine.queue(0, QueueKind::Direct).cloned(),
        engine.queue(0, QueueKind::Compute).cloned(),
        engine.queue(0, QueueKind::Copy).cloned(),
    ) else {
        unreachable!("the emulated device exposes all three queues");
    };

    let mut queries = direct.query_allocator();
    for frame in 0..FRAMES {
        let uploaded = engine.create_named_sync_point(SyncPointKind::GpuOnly, format!("upload {frame}"));
        let simulated = engine.create_named_sync_point(SyncPointKind::GpuOnly, format!("simulate {frame}"));
        let presented = engine.create_named_sync_point(SyncPointKind::GpuAndCpu, format!("frame {frame}"));

        let mut upload = engine.create_payload(&copy);
        upload
            .set_label("upload")
            .push_command_list(device.record([EmulatedCommand::Work { ticks: 50 }]))
            .signal(&uploaded);

        let mut simulate = engine.create_payload(&compute);
        simulate
            .set_label("simulate")
            .wait(&uploaded)
            .push_command_list(device.record([EmulatedCommand::Work { ticks: 200 }]))
            .signal(&simulated);

        let begin = QueryResult::with_unit(TimestampUnit::Ticks);
        let end = QueryResult::with_unit(TimestampUnit::Ticks);
        let begin_location = queries.allocate(QueryType::Timestamp, begin.clone())?;
        let end_location = queries.allocate(QueryType::Timestamp, end.clone())?;
        let mut render = engine.create_payload(&direct);
        render
            .set_label("render")
            .wait(&simulated)
            .push_command_list(device.record([
                EmulatedCommand::write_timestamp(&begin_location),
                EmulatedCommand::Work { ticks: 400 },
                EmulatedCommand::write_timestamp(&end_location),
            ]))
            .add_queries(queries.close())
            .signal(&presented);

        // enqueued out of order: the engine holds back payloads until their waits resolve
        engine.submit([render, simulate, upload]);
        if presented.wait().is_err() {
            eprintln!("device lost during frame {frame}");
            break;
        }

        if let (Some(QueryValue::Timestamp(begin)), Some(QueryValue::Timestamp(end))) = (begin.get(), end.get()) {
            println!("frame {frame}: render pass took {} ticks", end - begin);
        }
        for (queue, timing) in engine.end_frame().queues {
            println!("  {queue}: {} payloads, {:?} busy", timing.payloads, timing.busy);
        }
    }

    if engine.drain_until_idle().is_ok() {
        println!("{:?}", engine.stats());
    }
    Ok(())
}
