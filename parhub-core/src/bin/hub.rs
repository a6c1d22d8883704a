//! Hub service binary
//!
//! Builds a hub from `PARHUB_*` environment variables, optionally starts
//! `PARHUB_ENGINES` in-process engines against it, and runs until Ctrl-C.

use std::thread;
use std::time::Duration;

use parhub_core::metrics::gather_hub_metrics;
use parhub_core::{Context, Engine, HubConfig, HubFactory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting ParHub");

    let config = HubConfig::from_env();
    let engines: usize = std::env::var("PARHUB_ENGINES")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    let ctx = Context::new();
    let mut server = HubFactory::from_config(config).build(&ctx)?;
    let hub_stop = server.shutdown_signal();
    let engine_info = server.engine_info().clone();

    let mut hub = tokio::task::spawn_blocking(move || {
        server.run();
        server
    });

    let mut engine_threads = Vec::with_capacity(engines);
    for n in 0..engines {
        let mut engine = Engine::new(&ctx);
        engine.provide_service("default");
        let stop = engine.shutdown_signal();
        let info = engine_info.clone();
        let name = format!("engine-{}", n);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = engine.run(&name, &info) {
                error!("Engine `{}' failed: {}", name, e);
            }
        })?;
        engine_threads.push((stop, handle));
    }

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            None
        }
        server = &mut hub => {
            info!("Hub shut down on request");
            Some(server?)
        }
    };

    for (stop, handle) in engine_threads {
        stop.shutdown();
        if handle.join().is_err() {
            error!("Engine thread panicked");
        }
    }

    let server = match finished {
        Some(server) => server,
        None => {
            // let unregistrations land before the hub stops reading
            tokio::time::sleep(Duration::from_millis(100)).await;
            hub_stop.shutdown();
            hub.await?
        }
    };
    info!(
        "Hub stopped with {} engines and {} tasks on record",
        server.hub().num_engines(),
        server.hub().ledger().len()
    );
    info!("Final metrics:\n{}", gather_hub_metrics());
    Ok(())
}
