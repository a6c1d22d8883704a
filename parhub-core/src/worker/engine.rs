//! Minimal engine
//!
//! Starts a heart, registers with the hub and waits for the registration
//! reply. Unregisters and stops its heart when its reactor stops.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::heart::{Heart, HeartHandle};
use crate::error::{HubError, Result};
use crate::protocol::messages::{
    self, EngineConnectionInfo, Registration, RegistrationAck, Unregistration,
};
use crate::protocol::{Context, DealerSocket, EngineId, Message, QueryKind, Reply};
use crate::runtime::{Interest, Reactor, ShutdownSignal};

/// Reactor state of a running engine
#[derive(Default)]
pub struct EngineLink {
    name: String,
    queue: String,
    id: Option<EngineId>,
    rejected: Option<String>,
    heart: Option<HeartHandle>,
    registration: Option<DealerSocket>,
}

impl EngineLink {
    pub fn engine_id(&self) -> Option<EngineId> {
        self.id
    }

    pub fn registered(&self) -> bool {
        self.id.is_some()
    }

    /// Reason the hub gave for refusing this engine, if it did
    pub fn rejected(&self) -> Option<&str> {
        self.rejected.as_deref()
    }

    /// Pings answered by this engine's heart
    pub fn beats(&self) -> u64 {
        self.heart.as_ref().map(|heart| heart.count()).unwrap_or(0)
    }

    fn handle_reply(&mut self, msg: Message) {
        let tag = match msg.str_at(0) {
            Ok(tag) => tag,
            Err(e) => {
                warn!("Engine `{}' dropping reply: {}", self.name, e);
                return;
            }
        };
        if tag == QueryKind::Registration.reply_tag() {
            match msg.decode_at::<Reply<RegistrationAck>>(1) {
                Ok(Reply::Ok(ack)) => {
                    info!("Engine `{}' registered as {}", self.name, ack.id);
                    self.id = Some(ack.id);
                }
                Ok(Reply::Error { ename, reason }) => {
                    error!("Engine `{}' registration failed: {}: {}", self.name, ename, reason);
                    self.rejected = Some(reason);
                }
                Err(e) => warn!("Engine `{}' got a malformed registration reply: {}", self.name, e),
            }
        } else if tag == QueryKind::Unregistration.reply_tag() {
            debug!("Engine `{}' unregistration acknowledged", self.name);
        } else {
            warn!("Engine `{}' ignoring unexpected `{}'", self.name, tag);
        }
    }

    /// Tell the hub we are leaving and stop the heart
    fn leave(&mut self) {
        if let (Some(id), Some(dealer)) = (self.id, self.registration.take()) {
            let request = messages::query(
                QueryKind::Unregistration,
                &Unregistration {
                    queue: self.queue.clone(),
                },
            );
            match request {
                Ok(msg) => {
                    if dealer.send(msg) {
                        info!("Engine {} unregistering", id);
                    } else {
                        warn!("Engine {} could not reach the hub to unregister", id);
                    }
                }
                Err(e) => error!("Could not encode unregistration: {}", e),
            }
        }
        if let Some(heart) = self.heart.take() {
            heart.stop();
        }
    }
}

/// An engine that registers itself and idles until shut down
pub struct Engine {
    ctx: Context,
    services: Vec<String>,
    reactor: Reactor<EngineLink>,
    link: EngineLink,
}

impl Engine {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            services: Vec::new(),
            reactor: Reactor::new(),
            link: EngineLink::default(),
        }
    }

    /// Advertise a service name in the registration request
    pub fn provide_service(&mut self, service: &str) {
        self.services.push(service.to_string());
    }

    /// Register as `name` and run until shut down
    ///
    /// The queue identity is `{name}-queue` and the heart identity
    /// `{name}-heart`.
    pub fn run(&mut self, name: &str, info: &EngineConnectionInfo) -> Result<()> {
        if !self.link.name.is_empty() {
            return Err(HubError::Internal {
                message: format!("engine `{}' already started", self.link.name),
            });
        }
        let queue = format!("{}-queue", name);
        let heart = Heart::new(&info.heartbeat[0], &info.heartbeat[1], &format!("{}-heart", name))
            .spawn(&self.ctx)?;
        let dealer = DealerSocket::connect(&self.ctx, &info.registration, &format!("{}-reg", name));
        self.reactor.add(
            "registration",
            dealer.inbox(),
            Interest::Readable,
            |link: &mut EngineLink, _, msg| link.handle_reply(msg),
        )?;

        let request = Registration {
            heartbeat: heart.id().to_string(),
            queue: queue.clone(),
            registration: name.to_string(),
            services: self.services.clone(),
        };
        if !dealer.send(messages::query(QueryKind::Registration, &request)?) {
            warn!("No hub at {}, registration dropped", info.registration);
        }
        info!("Engine `{}' requested registration at {}", name, info.registration);

        self.link.name = name.to_string();
        self.link.queue = queue;
        self.link.heart = Some(heart);
        self.link.registration = Some(dealer);

        self.reactor.run(&mut self.link);
        self.link.leave();
        Ok(())
    }

    /// Stop after `after`, unregistering on the way out
    pub fn schedule_shutdown(&mut self, after: Duration) {
        let stop = self.reactor.shutdown_signal();
        self.reactor.schedule(after, move |_, _| stop.shutdown());
    }

    /// Stop the reactor; `run` unregisters before returning
    pub fn shutdown(&self) {
        self.reactor.shutdown();
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.reactor.shutdown_signal()
    }

    pub fn link(&self) -> &EngineLink {
        &self.link
    }

    pub fn engine_id(&self) -> Option<EngineId> {
        self.link.engine_id()
    }

    pub fn registered(&self) -> bool {
        self.link.registered()
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor<EngineLink> {
        &mut self.reactor
    }
}
