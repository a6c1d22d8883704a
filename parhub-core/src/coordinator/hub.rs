//! Hub orchestration
//!
//! The hub is the state value of its reactor. It routes monitor traffic into
//! the task ledger, answers client queries, and runs the registration state
//! machine off the heart monitor's callbacks.

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::heartmonitor::{HeartHost, HeartMonitor};
use super::ledger::{ResultDisposition, TaskLedger};
use super::registry::{EngineRecord, EngineRegistry};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::metrics::standard;
use crate::protocol::messages::{
    self, ClientConnectionInfo, ConnectionReply, DbQuery, DbReply, EngineConnectionInfo,
    EngineNotification, HistoryReply, IoPubHeader, LoadReply, LoadRequest, PurgeReply,
    PurgeRequest, QueueStatusReply, QueueStatusRequest, Registration, RegistrationAck,
    ResubmitReply, ResubmitRequest, ResultRequest, ShutdownAck, TaskDestination,
    TaskRequestHeader, TaskResultHeader, Unregistration,
};
use crate::protocol::{
    notification, DealerSocket, EngineId, Lane, Message, MonitorKind, PubSocket, QueryKind, Reply,
    RouterSocket, SubSocket,
};
use crate::runtime::{Interest, Reactor, ShutdownSignal, TimerQueue};

/// Sockets the hub owns
pub struct HubSockets {
    /// Heartbeat ping/pong pair
    pub heartmonitor: HeartMonitor<Hub>,
    /// Registration and client queries
    pub query: RouterSocket,
    /// Sink for task lifecycle events
    pub monitor: SubSocket,
    /// Membership change broadcasts
    pub notifier: PubSocket,
    /// Channel used to re-send completed tasks
    pub resubmit: DealerSocket,
}

pub struct Hub {
    config: HubConfig,
    heartmonitor: HeartMonitor<Hub>,
    registry: EngineRegistry,
    ledger: TaskLedger,
    query: RouterSocket,
    monitor: SubSocket,
    notifier: PubSocket,
    resubmit: DealerSocket,
    engine_info: EngineConnectionInfo,
    client_info: ClientConnectionInfo,
    stop: Option<ShutdownSignal>,
}

impl HeartHost for Hub {
    fn heart_monitor(&mut self) -> &mut HeartMonitor<Self> {
        &mut self.heartmonitor
    }
}

impl Hub {
    pub fn new(
        config: HubConfig,
        sockets: HubSockets,
        engine_info: EngineConnectionInfo,
        client_info: ClientConnectionInfo,
    ) -> Self {
        let mut heartmonitor = sockets.heartmonitor;
        heartmonitor.on_new_heart(|hub: &mut Hub, _, heart| hub.handle_new_heart(heart));
        heartmonitor.on_heart_failure(|hub: &mut Hub, timers, heart| {
            hub.handle_heart_failure(timers, heart)
        });

        info!("Created hub");
        Self {
            config,
            heartmonitor,
            registry: EngineRegistry::new(),
            ledger: TaskLedger::new(),
            query: sockets.query,
            monitor: sockets.monitor,
            notifier: sockets.notifier,
            resubmit: sockets.resubmit,
            engine_info,
            client_info,
            stop: None,
        }
    }

    /// Register the hub's endpoints and the first heartbeat with `reactor`
    pub fn attach(&mut self, reactor: &mut Reactor<Hub>) -> Result<()> {
        self.heartmonitor.attach(reactor)?;
        reactor.add(
            "query",
            self.query.inbox(),
            Interest::Readable,
            |hub: &mut Hub, timers, msg| hub.dispatch_query(timers, msg),
        )?;
        reactor.add(
            "monitor",
            self.monitor.inbox(),
            Interest::Readable,
            |hub: &mut Hub, _, msg| hub.dispatch_monitor_traffic(msg),
        )?;
        self.stop = Some(reactor.shutdown_signal());
        Ok(())
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Engine by id; unknown ids are a typed fault
    pub fn get_engine(&self, id: EngineId) -> Result<&EngineRecord> {
        self.registry.get(id)
    }

    /// Engine by queue identity; unknown identities are a typed fault
    pub fn get_engine_by_queue(&self, queue: &str) -> Result<&EngineRecord> {
        self.registry.get_by_queue(queue)
    }

    /// Number of active engines
    pub fn num_engines(&self) -> usize {
        self.registry.active_count()
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn heartmonitor(&self) -> &HeartMonitor<Hub> {
        &self.heartmonitor
    }

    pub fn engine_info(&self) -> &EngineConnectionInfo {
        &self.engine_info
    }

    pub fn client_info(&self) -> &ClientConnectionInfo {
        &self.client_info
    }

    /// Stop the reactor driving this hub
    pub fn shutdown(&self) {
        info!(
            "Hub shutting down, {} connected engines",
            self.registry.active_count()
        );
        match &self.stop {
            Some(stop) => stop.shutdown(),
            None => warn!("Hub is not attached to a reactor"),
        }
    }

    // ========== Dispatch ==========

    /// Handle `[identity, tag, payload...]` from the query socket
    pub fn dispatch_query(&mut self, timers: &mut TimerQueue<Hub>, msg: Message) {
        let identity = match msg.frame(0) {
            Ok(identity) => identity.clone(),
            Err(e) => {
                warn!("Dropping query: {}", e);
                return;
            }
        };
        let kind = match msg.str_at(1).and_then(|tag| tag.parse::<QueryKind>()) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(
                    "Dropping query from `{}': {}",
                    String::from_utf8_lossy(&identity),
                    e
                );
                return;
            }
        };
        debug!("Query {} from `{}'", kind, String::from_utf8_lossy(&identity));
        standard::QUERIES.inc(kind.as_str());

        let result = standard::QUERY_DURATION.time(|| match kind {
            QueryKind::QueueStatus => self.queue_status(&identity, &msg),
            QueryKind::Results => self.get_results(&identity, &msg),
            QueryKind::History => self.get_history(&identity),
            QueryKind::Db => self.db_query(&identity, &msg),
            QueryKind::Purge => self.purge_results(&identity, &msg),
            QueryKind::Load => self.check_load(&identity, &msg),
            QueryKind::Resubmit => self.resubmit_task(&identity, &msg),
            QueryKind::Shutdown => self.shutdown_request(timers, &identity),
            QueryKind::Registration => self.register_engine(timers, &identity, &msg),
            QueryKind::Unregistration => self.unregister_engine(&identity, &msg),
            QueryKind::Connection => self.connection_request(&identity),
        });

        if let Err(e) = result {
            if e.is_decode_failure() {
                warn!("Dropping malformed {}: {}", kind, e);
            } else if e.is_caller_fault() {
                debug!("{} failed: {}", kind, e);
                self.respond::<()>(identity, kind, &Reply::from_error(&e), Vec::new());
            } else {
                error!("{} failed: {}", kind, e);
            }
        }
    }

    /// Handle `[tag, header, content?]` from the monitor socket
    pub fn dispatch_monitor_traffic(&mut self, msg: Message) {
        let kind = match msg.str_at(0).and_then(|tag| tag.parse::<MonitorKind>()) {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping monitor message: {}", e);
                return;
            }
        };
        standard::MONITOR_MESSAGES.inc(kind.as_str());

        let result = match kind {
            MonitorKind::QueueRequest => self.save_task_request(Lane::Immediate, &msg),
            MonitorKind::QueueResult => self.save_task_result(Lane::Immediate, &msg),
            MonitorKind::TaskRequest => self.save_task_request(Lane::Scheduled, &msg),
            MonitorKind::TaskResult => self.save_task_result(Lane::Scheduled, &msg),
            MonitorKind::TaskDestination => self.save_task_destination(&msg),
            MonitorKind::ControlRequest | MonitorKind::ControlReply => Ok(()),
            MonitorKind::IoPub => self.save_iopub_message(&msg),
        };
        if let Err(e) = result {
            warn!("Dropping {} message: {}", kind, e);
        }
        standard::PENDING_TASKS.set(self.ledger.pending_count() as i64);
    }

    // ========== Outbound ==========

    fn respond<T: Serialize>(
        &self,
        identity: Bytes,
        kind: QueryKind,
        content: &Reply<T>,
        trailing: Vec<Bytes>,
    ) {
        let peer = String::from_utf8_lossy(&identity).into_owned();
        let mut msg = match messages::reply(identity, kind, content) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Could not encode {}: {}", kind.reply_tag(), e);
                return;
            }
        };
        for frame in trailing {
            msg.push(frame);
        }
        if let Err(e) = self.query.send(msg) {
            warn!("Could not send {} to `{}': {}", kind.reply_tag(), peer, e);
        }
    }

    fn notify(&self, tag: &'static str, payload: &EngineNotification) {
        match messages::engine_notification(tag, payload) {
            Ok(msg) => {
                let delivered = self.notifier.send(msg);
                debug!("{} for engine {} sent to {} subscribers", tag, payload.id, delivered);
            }
            Err(e) => error!("Could not encode {}: {}", tag, e),
        }
    }

    // ========== Registration ==========

    fn register_engine(
        &mut self,
        timers: &mut TimerQueue<Hub>,
        identity: &Bytes,
        msg: &Message,
    ) -> Result<()> {
        let reg: Registration = msg.decode_at(2)?;
        if let Err(e) = self.registry.check_available(&reg.heartbeat, &reg.queue) {
            error!("Registration of `{}' rejected: {}", reg.queue, e);
            standard::REGISTRATIONS_REJECTED.inc();
            return Err(e);
        }

        let heart = reg.heartbeat.clone();
        let id = self.registry.insert_pending(reg, Some(identity.clone()))?;
        debug!("Registering engine {} with heart `{}'", id, heart);

        if self.heartmonitor.alive(&heart) {
            info!("Heart `{}' already beating, finishing registration", heart);
            self.finish_registration(&heart);
        } else {
            info!("Heart `{}' not beating yet, waiting to finish registration", heart);
            let timeout = self.config.registration_timeout();
            let stalled = heart.clone();
            let handle = timers.schedule(timeout, move |hub: &mut Hub, _| {
                hub.purge_stalled_registration(&stalled)
            });
            self.registry.arm_deletion(id, handle);
        }
        Ok(())
    }

    /// Second half of registration, once the engine's heart has beaten
    pub fn finish_registration(&mut self, heart: &str) {
        let Some(record) = self.registry.promote(heart) else {
            error!("Trying to finish non-existent registration of heart `{}'", heart);
            return;
        };
        let id = record.id;
        let requester = record.take_requester();
        let note = record.notification();
        info!(
            "Finishing registration of engine {}: `{}' ({})",
            id,
            note.queue,
            note.services.join(", ")
        );

        self.notify(notification::REGISTRATION, &note);
        if let Some(identity) = requester {
            self.respond(
                identity,
                QueryKind::Registration,
                &Reply::Ok(RegistrationAck { id }),
                Vec::new(),
            );
        }
        standard::REGISTERED_ENGINES.set(self.registry.active_count() as i64);
        info!("Engine connected: {}", id);
    }

    fn purge_stalled_registration(&mut self, heart: &str) {
        let Some(mut record) = self.registry.purge_pending(heart) else {
            return;
        };
        warn!("Purging stalled registration of engine {} (`{}')", record.id, record.queue);
        standard::REGISTRATIONS_REJECTED.inc();
        if let Some(identity) = record.take_requester() {
            let err = HubError::RegistrationRejected {
                reason: format!("heart `{}' did not beat in time", heart),
            };
            self.respond::<RegistrationAck>(
                identity,
                QueryKind::Registration,
                &Reply::from_error(&err),
                Vec::new(),
            );
        }
    }

    fn handle_new_heart(&mut self, heart: &str) {
        if self.registry.pending_for_heart(heart).is_some() {
            self.finish_registration(heart);
        } else {
            info!("Ignoring new heart `{}'", heart);
        }
    }

    fn handle_heart_failure(&mut self, timers: &mut TimerQueue<Hub>, heart: &str) {
        let record = match self.registry.id_by_heart(heart).map(|id| self.registry.get(id)) {
            Some(Ok(record)) if record.is_active() && !self.registry.is_dead(&record.queue) => {
                record
            }
            _ => {
                info!("Ignoring failure of heart `{}'", heart);
                return;
            }
        };
        let id = record.id;
        let queue = record.queue.clone();
        let note = record.notification();
        warn!("Engine {} (`{}') lost its heart, unregistering", id, queue);

        self.registry.mark_dead(&queue);
        self.notify(notification::UNREGISTRATION, &note);

        // results may still be in flight from an engine that died right after finishing
        let grace = self.config.registration_timeout();
        timers.schedule(grace, move |hub: &mut Hub, _| {
            hub.handle_stranded_tasks(id, &queue)
        });
    }

    fn handle_stranded_tasks(&mut self, id: EngineId, queue: &str) {
        let stranded = self.ledger.stranded_sweep(id, queue);
        if !stranded.is_empty() {
            warn!(
                "{} tasks stranded on dead engine {} (`{}')",
                stranded.len(),
                id,
                queue
            );
            standard::STRANDED_TASKS.inc_by(stranded.len() as u64);
        }
        if self.registry.remove(id).is_none() {
            error!("Handling stranded tasks for unknown engine {}", id);
        }
        standard::REGISTERED_ENGINES.set(self.registry.active_count() as i64);
        standard::PENDING_TASKS.set(self.ledger.pending_count() as i64);
    }

    fn unregister_engine(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: Unregistration = msg.decode_at(2)?;
        let id = match self.registry.get_by_queue(&req.queue) {
            Ok(record) if record.is_active() => record.id,
            _ => {
                error!("Trying to unregister unknown engine `{}'", req.queue);
                return Err(HubError::UnknownEngine { engine: req.queue });
            }
        };
        let Some(record) = self.registry.remove(id) else {
            return Err(HubError::UnknownEngine { engine: req.queue });
        };
        info!("Unregistering engine {} (`{}')", id, req.queue);

        self.respond(
            identity.clone(),
            QueryKind::Unregistration,
            &Reply::Ok(RegistrationAck { id }),
            Vec::new(),
        );
        self.notify(notification::UNREGISTRATION, &record.notification());
        standard::REGISTERED_ENGINES.set(self.registry.active_count() as i64);
        Ok(())
    }

    // ========== Queries ==========

    /// Requested engine ids, or every live engine when none were named;
    /// any unknown id fails the whole lookup
    fn resolve_targets(&self, targets: Option<Vec<EngineId>>) -> Result<Vec<EngineId>> {
        match targets {
            Some(ids) => ids
                .into_iter()
                .map(|id| self.registry.require_active(id).map(|record| record.id))
                .collect(),
            None => Ok(self
                .registry
                .active()
                .filter(|record| !self.registry.is_dead(&record.queue))
                .map(|record| record.id)
                .collect()),
        }
    }

    fn check_load(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: LoadRequest = msg.decode_at(2)?;
        let load: LoadReply = self
            .resolve_targets(req.targets)?
            .into_iter()
            .map(|id| (id, self.ledger.load(id)))
            .collect();
        self.respond(identity.clone(), QueryKind::Load, &Reply::Ok(load), Vec::new());
        Ok(())
    }

    fn queue_status(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: QueueStatusRequest = msg.decode_at(2)?;
        let engines = self
            .resolve_targets(req.targets)?
            .into_iter()
            .map(|id| (id, self.ledger.queue_status(id, req.verbose)))
            .collect();
        let reply = QueueStatusReply {
            engines,
            unassigned: self.ledger.unassigned(),
        };
        self.respond(identity.clone(), QueryKind::QueueStatus, &Reply::Ok(reply), Vec::new());
        Ok(())
    }

    fn purge_results(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: PurgeRequest = msg.decode_at(2)?;
        let purged = if req.all {
            self.ledger.purge_all()
        } else {
            self.ledger.purge(&req.msg_ids)? + self.ledger.purge_engines(&req.engine_ids)
        };
        info!("Purged {} task records", purged);
        standard::PENDING_TASKS.set(self.ledger.pending_count() as i64);
        self.respond(
            identity.clone(),
            QueryKind::Purge,
            &Reply::Ok(PurgeReply { purged }),
            Vec::new(),
        );
        Ok(())
    }

    fn get_results(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: ResultRequest = msg.decode_at(2)?;
        let (reply, frames) = self.ledger.results(&req.msg_ids, req.status_only)?;
        self.respond(identity.clone(), QueryKind::Results, &Reply::Ok(reply), frames);
        Ok(())
    }

    fn get_history(&mut self, identity: &Bytes) -> Result<()> {
        let reply = HistoryReply {
            history: self.ledger.history(),
        };
        self.respond(identity.clone(), QueryKind::History, &Reply::Ok(reply), Vec::new());
        Ok(())
    }

    fn db_query(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let filter: DbQuery = msg.decode_at(2)?;
        let reply = DbReply {
            records: self.ledger.query(&filter),
        };
        self.respond(identity.clone(), QueryKind::Db, &Reply::Ok(reply), Vec::new());
        Ok(())
    }

    fn resubmit_task(&mut self, identity: &Bytes, msg: &Message) -> Result<()> {
        let req: ResubmitRequest = msg.decode_at(2)?;
        let bodies = self.ledger.resubmittable(&req.msg_ids)?;
        let now = Utc::now();
        let mut resubmitted = Vec::with_capacity(bodies.len());
        for (msg_id, content) in bodies {
            if !self.resubmit.send(Message::new().with(msg_id.clone()).with(content)) {
                warn!("Resubmission of {} was dropped", msg_id);
            }
            self.ledger.mark_resubmitted(&msg_id, now);
            resubmitted.push(msg_id);
        }
        info!("Resubmitted {} tasks", resubmitted.len());
        self.respond(
            identity.clone(),
            QueryKind::Resubmit,
            &Reply::Ok(ResubmitReply { resubmitted }),
            Vec::new(),
        );
        Ok(())
    }

    fn shutdown_request(&mut self, timers: &mut TimerQueue<Hub>, identity: &Bytes) -> Result<()> {
        let delay = self.config.shutdown_delay;
        self.respond(
            identity.clone(),
            QueryKind::Shutdown,
            &Reply::Ok(ShutdownAck {
                delay_ms: delay.as_millis() as u64,
            }),
            Vec::new(),
        );
        self.notifier
            .send(Message::new().with(notification::SHUTDOWN));
        timers.schedule(delay, |hub: &mut Hub, _| hub.shutdown());
        Ok(())
    }

    fn connection_request(&mut self, identity: &Bytes) -> Result<()> {
        let engines = self
            .registry
            .active()
            .filter(|record| !self.registry.is_dead(&record.queue))
            .map(|record| (record.id, record.queue.clone()))
            .collect();
        let reply = ConnectionReply {
            client: self.client_info.clone(),
            engines,
        };
        self.respond(identity.clone(), QueryKind::Connection, &Reply::Ok(reply), Vec::new());
        Ok(())
    }

    // ========== Monitor traffic ==========

    fn save_task_request(&mut self, lane: Lane, msg: &Message) -> Result<()> {
        let header: TaskRequestHeader = msg.decode_at(1)?;
        let content = msg.frame(2).cloned().unwrap_or_default();
        let engine = match header.engine.as_deref() {
            Some(queue) => {
                let id = self.registry.id_by_queue(queue);
                if id.is_none() {
                    warn!("Task {} routed to unknown engine `{}'", header.msg_id, queue);
                }
                id
            }
            None => None,
        };
        self.ledger.save_request(&header, lane, engine, content);
        Ok(())
    }

    fn save_task_result(&mut self, lane: Lane, msg: &Message) -> Result<()> {
        let header: TaskResultHeader = msg.decode_at(1)?;
        let result = msg.frame(2).cloned().unwrap_or_default();
        let engine = header
            .engine
            .as_deref()
            .and_then(|queue| self.registry.id_by_queue(queue));
        match self.ledger.save_result(&header, engine, result) {
            ResultDisposition::Completed => debug!("Task {} done ({:?})", header.msg_id, lane),
            ResultDisposition::Late | ResultDisposition::Unknown => {}
        }
        Ok(())
    }

    fn save_task_destination(&mut self, msg: &Message) -> Result<()> {
        let dest: TaskDestination = msg.decode_at(1)?;
        let id = self
            .registry
            .id_by_queue(&dest.engine)
            .ok_or_else(|| HubError::UnknownEngine {
                engine: dest.engine.clone(),
            })?;
        self.ledger.save_destination(&dest.msg_id, id, &dest.engine);
        Ok(())
    }

    fn save_iopub_message(&mut self, msg: &Message) -> Result<()> {
        let header: IoPubHeader = msg.decode_at(1)?;
        if !self
            .ledger
            .append_output(&header.msg_id, &header.stream, &header.text)
        {
            debug!("Output for unknown task {}", header.msg_id);
        }
        Ok(())
    }
}
