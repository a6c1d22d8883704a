//! Engine-side heart
//!
//! Subscribes to the hub's pings and echoes each one back on a dealer whose
//! identity is the heart id. Runs on its own thread so a busy engine still
//! answers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::protocol::{Context, DealerSocket, Message, SubSocket};
use crate::runtime::{Interest, Reactor, ShutdownSignal};

/// Heart configuration; call [`Heart::spawn`] to start beating
#[derive(Debug, Clone)]
pub struct Heart {
    ping_addr: String,
    pong_addr: String,
    id: String,
}

struct Beacon {
    // kept so the subscription lives as long as the thread
    _ping: SubSocket,
    pong: DealerSocket,
    count: Arc<AtomicU64>,
}

impl Beacon {
    fn echo(&mut self, msg: Message) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if !self.pong.send(msg) {
            debug!("Heart `{}' has nobody to answer", self.pong.identity());
        }
    }
}

impl Heart {
    /// An empty `id` gets a random one
    pub fn new(ping_addr: &str, pong_addr: &str, id: &str) -> Self {
        let id = if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        Self {
            ping_addr: ping_addr.to_string(),
            pong_addr: pong_addr.to_string(),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connect both sockets and start answering pings on a new thread
    pub fn spawn(self, ctx: &Context) -> Result<HeartHandle> {
        // connect before returning so no ping published after this is missed
        let ping = SubSocket::connect(ctx, &self.ping_addr);
        let pong = DealerSocket::connect(ctx, &self.pong_addr, &self.id);
        let count = Arc::new(AtomicU64::new(0));

        let mut reactor: Reactor<Beacon> = Reactor::new();
        reactor.add("ping", ping.inbox(), Interest::Readable, |beacon: &mut Beacon, _, msg| {
            beacon.echo(msg)
        })?;
        let stop = reactor.shutdown_signal();

        let mut beacon = Beacon {
            _ping: ping,
            pong,
            count: count.clone(),
        };
        let id = self.id.clone();
        let thread = thread::Builder::new()
            .name(format!("heart-{}", self.id))
            .spawn(move || {
                info!("Heart `{}' beating", id);
                reactor.run(&mut beacon);
                debug!("Heart `{}' stopped", id);
            })
            .map_err(|e| HubError::Internal {
                message: format!("could not start heart thread: {}", e),
            })?;

        Ok(HeartHandle {
            id: self.id,
            count,
            stop,
            thread: Some(thread),
        })
    }
}

/// A running heart; stops and joins on drop
pub struct HeartHandle {
    id: String,
    count: Arc<AtomicU64>,
    stop: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl HeartHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pings answered so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Ask the heart thread to stop without waiting for it
    pub fn shutdown(&self) {
        self.stop.shutdown();
    }

    /// Stop and wait for the heart thread
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Heart `{}' thread panicked", self.id);
            }
        }
    }
}

impl Drop for HeartHandle {
    fn drop(&mut self) {
        self.join();
    }
}
