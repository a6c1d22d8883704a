//! Hub construction
//!
//! Allocates ports, binds every hub socket and wires the hub into a fresh
//! reactor.

use std::time::Duration;

use tracing::info;

use super::heartmonitor::HeartMonitor;
use super::hub::{Hub, HubSockets};
use crate::config::{HubConfig, PortPool};
use crate::error::Result;
use crate::protocol::messages::{ClientConnectionInfo, EngineConnectionInfo};
use crate::protocol::{Context, DealerSocket, PubSocket, RouterSocket, SubSocket};
use crate::runtime::{PollOutcome, Reactor, ShutdownSignal};

/// Identity of the hub's resubmission socket
pub const RESUBMIT_IDENTITY: &str = "hub-resubmit";

/// In-process address the monitor sink is also bound at
pub const INPROC_MONITOR: &str = "inproc://monitor";

/// Builder for a [`HubServer`]
#[derive(Debug, Clone)]
pub struct HubFactory {
    config: HubConfig,
}

impl HubFactory {
    /// Start from defaults with ports allocated from `start_port`
    pub fn new(start_port: u16) -> Self {
        Self {
            config: HubConfig {
                start_port,
                ..HubConfig::default()
            },
        }
    }

    pub fn from_config(config: HubConfig) -> Self {
        Self { config }
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.config.ip = ip.to_string();
        self
    }

    pub fn transport(mut self, transport: &str) -> Self {
        self.config.transport = transport.to_string();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.config.registration_timeout = Some(timeout);
        self
    }

    pub fn shutdown_delay(mut self, delay: Duration) -> Self {
        self.config.shutdown_delay = delay;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Bind every socket in `ctx` and return a hub ready to run
    pub fn build(self, ctx: &Context) -> Result<HubServer> {
        let config = self.config;
        let mut pool = PortPool::new(config.start_port);
        let hb = pool.pair();
        let mux = pool.pair();
        let task = pool.pair();
        let control = pool.pair();
        let iopub = pool.pair();
        let monitor_port = pool.get();
        let notifier_port = pool.get();
        let registration_port = pool.get();

        let registration = config.address(registration_port);
        let query = RouterSocket::bind(ctx, &registration)?;
        info!("Hub listening on `{}' for registration", registration);

        let heartbeat = [config.address(hb[0]), config.address(hb[1])];
        let heartmonitor =
            HeartMonitor::bind(ctx, &heartbeat[0], &heartbeat[1], config.heartbeat_interval)?;

        let notification = config.address(notifier_port);
        let notifier = PubSocket::bind(ctx, &notification);

        let mut monitor = SubSocket::bind(ctx, &config.address(monitor_port))?;
        monitor.bind_also(ctx, INPROC_MONITOR)?;

        let client_info = ClientConnectionInfo {
            registration: registration.clone(),
            control: config.address(control[0]),
            mux: config.address(mux[0]),
            task: config.address(task[0]),
            task_scheme: "default".to_string(),
            iopub: config.address(iopub[0]),
            notification,
        };
        let engine_info = EngineConnectionInfo {
            registration,
            control: config.address(control[1]),
            mux: config.address(mux[1]),
            task: config.address(task[1]),
            iopub: config.address(iopub[1]),
            heartbeat,
        };
        info!(
            "Hub engine addrs: control {} mux {} iopub {} heart {} / {} task {}",
            engine_info.control,
            engine_info.mux,
            engine_info.iopub,
            engine_info.heartbeat[0],
            engine_info.heartbeat[1],
            engine_info.task
        );
        info!(
            "Hub client addrs: control {} mux {} iopub {} notify {} task {} ({})",
            client_info.control,
            client_info.mux,
            client_info.iopub,
            client_info.notification,
            client_info.task,
            client_info.task_scheme
        );

        let resubmit = DealerSocket::connect(ctx, &client_info.task, RESUBMIT_IDENTITY);

        let sockets = HubSockets {
            heartmonitor,
            query,
            monitor,
            notifier,
            resubmit,
        };
        let mut hub = Hub::new(config, sockets, engine_info, client_info);
        let mut reactor = Reactor::new();
        hub.attach(&mut reactor)?;
        Ok(HubServer { hub, reactor })
    }
}

/// A hub together with the reactor that drives it
pub struct HubServer {
    hub: Hub,
    reactor: Reactor<Hub>,
}

impl HubServer {
    /// Block until the hub is shut down
    pub fn run(&mut self) {
        self.reactor.run(&mut self.hub);
    }

    /// Run for at most `limit`
    pub fn run_for(&mut self, limit: Duration) {
        self.reactor.run_for(&mut self.hub, limit);
    }

    /// One reactor iteration
    pub fn poll(&mut self, timeout: Option<Duration>) -> PollOutcome {
        self.reactor.poll(&mut self.hub, timeout)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.reactor.shutdown_signal()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut Hub {
        &mut self.hub
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor<Hub> {
        &mut self.reactor
    }

    pub fn engine_info(&self) -> &EngineConnectionInfo {
        self.hub.engine_info()
    }

    pub fn client_info(&self) -> &ClientConnectionInfo {
        self.hub.client_info()
    }
}
