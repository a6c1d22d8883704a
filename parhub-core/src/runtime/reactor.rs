//! Single-threaded cooperative event loop
//!
//! Multiplexes readiness over registered transport inboxes plus a
//! [`TimerQueue`]. Every callback gets exclusive access to the loop's state
//! value `S`, so the state needs no locking.

use std::time::Duration;

use crossbeam::channel::{Select, TryRecvError};
use tracing::{debug, info, warn};

use super::shutdown::ShutdownSignal;
use super::timer::{TimerHandle, TimerQueue};
use crate::error::{HubError, Result};
use crate::protocol::{Inbox, Message};

/// Callback invoked with each message read from an endpoint
pub type EndpointCallback<S> = Box<dyn FnMut(&mut S, &mut TimerQueue<S>, Message) + Send>;

/// Readiness an endpoint is polled for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Inbound message available
    Readable,
}

/// What one call to [`Reactor::poll`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Messages dispatched and timers fired during this iteration
    Ran { messages: usize, timers: usize },
    /// Shutdown was requested; nothing was dispatched
    Shutdown,
}

struct Endpoint<S> {
    name: String,
    inbox: Inbox,
    interest: Interest,
    callback: EndpointCallback<S>,
    closed: bool,
}

/// Event loop over endpoints and timers
pub struct Reactor<S> {
    endpoints: Vec<Endpoint<S>>,
    timers: TimerQueue<S>,
    shutdown: ShutdownSignal,
}

impl<S> Reactor<S> {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            timers: TimerQueue::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Register an endpoint; callbacks run in registration order
    pub fn add<F>(&mut self, name: &str, inbox: Inbox, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(&mut S, &mut TimerQueue<S>, Message) + Send + 'static,
    {
        if self.endpoints.iter().any(|ep| ep.name == name) {
            return Err(HubError::DuplicateEndpoint {
                name: name.to_string(),
            });
        }
        debug!("Registered endpoint {} ({:?})", name, interest);
        self.endpoints.push(Endpoint {
            name: name.to_string(),
            inbox,
            interest,
            callback: Box::new(callback),
            closed: false,
        });
        Ok(())
    }

    /// Unregister an endpoint; returns whether it existed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|ep| ep.name != name);
        before != self.endpoints.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut S, &mut TimerQueue<S>) + Send + 'static,
    {
        self.timers.schedule(delay, callback)
    }

    pub fn timers_mut(&mut self) -> &mut TimerQueue<S> {
        &mut self.timers
    }

    /// Handle for stopping this reactor from any thread
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// One loop iteration: wait up to `min(timeout, next timer)`, dispatch at
    /// most one message per ready endpoint, then fire due timers
    pub fn poll(&mut self, state: &mut S, timeout: Option<Duration>) -> PollOutcome {
        if self.shutdown.is_requested() {
            return PollOutcome::Shutdown;
        }

        let wait = match (timeout, self.timers.next_wait()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        {
            let mut select = Select::new();
            select.recv(self.shutdown.receiver());
            for ep in self.endpoints.iter().filter(|ep| !ep.closed && ep.interest.is_readable()) {
                select.recv(&ep.inbox);
            }
            match wait {
                Some(wait) => {
                    let _ = select.ready_timeout(wait);
                }
                None => {
                    select.ready();
                }
            }
        }

        if self.shutdown.is_requested() {
            return PollOutcome::Shutdown;
        }

        let mut messages = 0;
        for ep in self.endpoints.iter_mut().filter(|ep| !ep.closed && ep.interest.is_readable()) {
            match ep.inbox.try_recv() {
                Ok(msg) => {
                    (ep.callback)(state, &mut self.timers, msg);
                    messages += 1;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    warn!("Endpoint {} disconnected, no longer polled", ep.name);
                    ep.closed = true;
                }
            }
        }

        let timers = self.timers.fire_due(state);
        PollOutcome::Ran { messages, timers }
    }

    /// Loop until shutdown is requested
    ///
    /// The signal is reset on return so the reactor can be run again.
    pub fn run(&mut self, state: &mut S) {
        info!("Reactor running with {} endpoints", self.endpoints.len());
        while self.poll(state, None) != PollOutcome::Shutdown {}
        self.shutdown.reset();
        info!("Reactor stopped");
    }

    /// Like [`run`](Self::run), but also stops once `limit` has elapsed
    pub fn run_for(&mut self, state: &mut S, limit: Duration) {
        let stop = self.shutdown.clone();
        let deadline = self.timers.schedule(limit, move |_, _| stop.shutdown());
        self.run(state);
        // a run stopped early must not leave its deadline for the next one
        deadline.cancel();
    }
}

impl<S> Default for Reactor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl Interest {
    pub fn is_readable(&self) -> bool {
        matches!(self, Interest::Readable)
    }
}
