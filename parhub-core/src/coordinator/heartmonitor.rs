//! Heartbeat monitor
//!
//! Broadcasts a ping carrying a logical timestamp every interval and collects
//! the echoed pongs. Hearts answering the current or the previous ping count
//! as alive; two consecutive misses fail a heart.

use std::mem;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::liveness::{Liveness, Transition};
use crate::error::Result;
use crate::metrics::standard;
use crate::protocol::{Context, Message, PubSocket, RouterSocket};
use crate::runtime::{Interest, Reactor, TimerQueue};

/// Callback invoked with a heart identity on a liveness transition
pub type HeartHandler<S> = Box<dyn FnMut(&mut S, &mut TimerQueue<S>, &str) + Send>;

/// Reactor state that owns a heart monitor
pub trait HeartHost: Sized + Send + 'static {
    fn heart_monitor(&mut self) -> &mut HeartMonitor<Self>;
}

pub struct HeartMonitor<S> {
    ping: PubSocket,
    pong: RouterSocket,
    interval: Duration,
    lifetime: DateTime<Utc>,
    last_ping: DateTime<Utc>,
    tic: Instant,
    liveness: Liveness,
    new_heart_handlers: Vec<HeartHandler<S>>,
    failure_handlers: Vec<HeartHandler<S>>,
    beats: u64,
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl<S> HeartMonitor<S> {
    pub fn new(ping: PubSocket, pong: RouterSocket, interval: Duration) -> Self {
        let now = Utc::now();
        Self {
            ping,
            pong,
            interval,
            lifetime: now,
            last_ping: now,
            tic: Instant::now(),
            liveness: Liveness::new(),
            new_heart_handlers: Vec::new(),
            failure_handlers: Vec::new(),
            beats: 0,
        }
    }

    /// Publish pings at `ping_addr` and collect pongs at `pong_addr`
    pub fn bind(ctx: &Context, ping_addr: &str, pong_addr: &str, interval: Duration) -> Result<Self> {
        let ping = PubSocket::bind(ctx, ping_addr);
        let pong = RouterSocket::bind(ctx, pong_addr)?;
        Ok(Self::new(ping, pong, interval))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `heart` is currently tracked as alive
    pub fn alive(&self, heart: &str) -> bool {
        self.liveness.is_alive(heart)
    }

    pub fn on_probation(&self, heart: &str) -> bool {
        self.liveness.on_probation(heart)
    }

    pub fn alive_count(&self) -> usize {
        self.liveness.alive_count()
    }

    /// Number of beats since start
    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Timestamp carried by the most recent ping
    pub fn current_ping(&self) -> String {
        stamp(&self.lifetime)
    }

    /// Register a callback for hearts seen for the first time
    pub fn on_new_heart<F>(&mut self, handler: F)
    where
        F: FnMut(&mut S, &mut TimerQueue<S>, &str) + Send + 'static,
    {
        self.new_heart_handlers.push(Box::new(handler));
    }

    /// Register a callback for failed hearts
    pub fn on_heart_failure<F>(&mut self, handler: F)
    where
        F: FnMut(&mut S, &mut TimerQueue<S>, &str) + Send + 'static,
    {
        self.failure_handlers.push(Box::new(handler));
    }

    /// Handle `[heart, echoed_timestamp]` from the pong socket
    pub fn handle_pong(&mut self, msg: Message) {
        let (heart, received) = match (msg.str_at(0), msg.str_at(1)) {
            (Ok(heart), Ok(received)) => (heart, received),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Dropping malformed pong: {}", e);
                return;
            }
        };

        if received == stamp(&self.lifetime) {
            debug!(
                "Heart `{}' responded in time, took {:?}",
                heart,
                Utc::now() - self.lifetime
            );
        } else if received == stamp(&self.last_ping) {
            debug!(
                "Heart `{}' missed a beat, took {:?}",
                heart,
                Utc::now() - self.last_ping
            );
        } else {
            debug!(
                "Stale pong from `{}': {} (current: {})",
                heart,
                received,
                stamp(&self.lifetime)
            );
            return;
        }
        standard::PONGS_RECEIVED.inc();
        self.liveness.record(heart);
    }

    /// Roll the logical clock and close the round
    fn roll(&mut self) -> Transition {
        self.last_ping = self.lifetime;
        let toc = Instant::now();
        let elapsed = toc.duration_since(self.tic);
        self.lifetime += chrono::Duration::microseconds(elapsed.as_micros() as i64);
        self.tic = toc;
        self.beats += 1;
        self.liveness.close_round()
    }

    fn send_ping(&self) {
        let delivered = self.ping.send(Message::new().with(stamp(&self.lifetime)));
        debug!("Ping {} delivered to {} hearts", stamp(&self.lifetime), delivered);
    }
}

impl<S: HeartHost> HeartMonitor<S> {
    /// Register the pong endpoint and arm the first beat
    pub fn attach(&self, reactor: &mut Reactor<S>) -> Result<()> {
        reactor.add(
            "heartbeat",
            self.pong.inbox(),
            Interest::Readable,
            |host: &mut S, _, msg| host.heart_monitor().handle_pong(msg),
        )?;
        reactor.schedule(self.interval, beat::<S>);
        Ok(())
    }
}

/// One heartbeat cycle; re-arms itself
pub fn beat<S: HeartHost>(host: &mut S, timers: &mut TimerQueue<S>) {
    let monitor = host.heart_monitor();
    timers.schedule(monitor.interval, beat::<S>);

    let transition = monitor.roll();
    let mut new_heart_handlers = mem::take(&mut monitor.new_heart_handlers);
    let mut failure_handlers = mem::take(&mut monitor.failure_handlers);

    for heart in &transition.new_hearts {
        info!("New heart `{}'", heart);
        for handler in new_heart_handlers.iter_mut() {
            handler(host, timers, heart);
        }
    }
    for heart in &transition.failures {
        warn!("Heart `{}' failed", heart);
        standard::HEART_FAILURES.inc();
        for handler in failure_handlers.iter_mut() {
            handler(host, timers, heart);
        }
    }

    let monitor = host.heart_monitor();
    // keep handlers registered while we were running them
    new_heart_handlers.append(&mut monitor.new_heart_handlers);
    failure_handlers.append(&mut monitor.failure_handlers);
    monitor.new_heart_handlers = new_heart_handlers;
    monitor.failure_handlers = failure_handlers;

    monitor.send_ping();
}
