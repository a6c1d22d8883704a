//! Stress tests for the hub under load
//!
//! Run with: cargo test --release --test stress_hub -- --nocapture

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parhub_core::coordinator::factory::INPROC_MONITOR;
use parhub_core::protocol::messages::{
    self, Registration, RegistrationAck, TaskRequestHeader, TaskResultHeader,
};
use parhub_core::protocol::{Lane, PubSocket, QueryKind};
use parhub_core::worker::{ClientConfig, Engine, Heart, HubClient};
use parhub_core::{Context, HubFactory};

/// Test registration scalability
#[test]
fn stress_engine_registration() {
    let num_engines = 64;
    let ctx = Context::new();
    let mut server = HubFactory::new(11000)
        .heartbeat_interval(Duration::from_millis(50))
        .registration_timeout(Duration::from_secs(5))
        .build(&ctx)
        .unwrap();
    let client = HubClient::connect(
        &ctx,
        ClientConfig {
            hub_addr: server.client_info().registration.clone(),
            identity: "stress".into(),
            request_timeout: Duration::from_secs(1),
        },
    );

    let hb = server.engine_info().heartbeat.clone();
    let hearts: Vec<_> = (0..num_engines)
        .map(|n| Heart::new(&hb[0], &hb[1], &format!("h{}", n)).spawn(&ctx).unwrap())
        .collect();

    let start = Instant::now();
    for n in 0..num_engines {
        client
            .send_request(
                QueryKind::Registration,
                &Registration {
                    heartbeat: format!("h{}", n),
                    queue: format!("q{}", n),
                    registration: format!("engine-{}", n),
                    services: Vec::new(),
                },
            )
            .unwrap();
    }
    server.run_for(Duration::from_millis(500));

    let mut ids: Vec<u32> = (0..num_engines)
        .map(|_| {
            client
                .recv_reply::<RegistrationAck>(QueryKind::Registration)
                .unwrap()
                .0
                .id
                .0
        })
        .collect();
    ids.sort_unstable();

    println!("Engine registration stress test:");
    println!("  Engines: {}", num_engines);
    println!("  Total elapsed: {:?}", start.elapsed());
    println!("  Beats answered by h0: {}", hearts[0].count());

    assert_eq!(ids, (0..num_engines as u32).collect::<Vec<_>>());
    assert_eq!(server.hub().num_engines(), num_engines);
    assert_eq!(server.hub().heartmonitor().alive_count(), num_engines);
}

/// Test monitor traffic throughput
#[test]
fn stress_task_throughput() {
    let num_tasks = 20_000;
    let ctx = Context::new();
    let mut server = HubFactory::new(12000).build(&ctx).unwrap();
    let monitor = PubSocket::connect(&ctx, INPROC_MONITOR);

    let publisher = thread::spawn(move || {
        for n in 0..num_tasks {
            let msg_id = format!("t{:05}", n);
            let request = TaskRequestHeader {
                msg_id: msg_id.clone(),
                client: format!("c{}", n % 8),
                engine: None,
                submitted: None,
            };
            monitor.send(messages::task_request(Lane::Immediate, &request, Bytes::from_static(b"x")).unwrap());
            let result = TaskResultHeader {
                msg_id,
                engine: None,
                started: None,
                completed: None,
            };
            monitor.send(messages::task_result(Lane::Immediate, &result, Bytes::from_static(b"y")).unwrap());
        }
    });

    let start = Instant::now();
    while server.hub().ledger().completed_count() < num_tasks && start.elapsed() < Duration::from_secs(30) {
        server.run_for(Duration::from_millis(50));
    }
    publisher.join().unwrap();
    let elapsed = start.elapsed();

    println!("Task throughput stress test:");
    println!("  Tasks: {}", num_tasks);
    println!("  Total elapsed: {:?}", elapsed);
    println!("  Tasks/sec: {:.2}", num_tasks as f64 / elapsed.as_secs_f64());

    assert_eq!(server.hub().ledger().len(), num_tasks);
    assert_eq!(server.hub().ledger().completed_count(), num_tasks);
    assert_eq!(server.hub().ledger().pending_count(), 0);
}

/// Test engines joining and leaving while the hub runs
#[test]
fn stress_engine_churn() {
    let num_engines = 16;
    let ctx = Context::new();
    let mut server = HubFactory::new(13000)
        .heartbeat_interval(Duration::from_millis(50))
        .build(&ctx)
        .unwrap();
    let info = server.engine_info().clone();

    let engines: Vec<_> = (0..num_engines)
        .map(|n| {
            let ctx = ctx.clone();
            let info = info.clone();
            thread::spawn(move || {
                let mut engine = Engine::new(&ctx);
                engine.schedule_shutdown(Duration::from_millis(300 + 20 * n as u64));
                engine.run(&format!("e{}", n), &info).unwrap();
                engine.registered()
            })
        })
        .collect();

    server.run_for(Duration::from_millis(1000));
    let registered = engines
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|ok| *ok)
        .count();

    println!("Engine churn stress test:");
    println!("  Engines: {}", num_engines);
    println!("  Registered: {}", registered);

    assert_eq!(registered, num_engines);
    assert!(server.hub().registry().is_empty());
}
