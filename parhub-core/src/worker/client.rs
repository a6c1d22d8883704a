//! Hub client
//!
//! Blocking request/reply wrapper over a dealer connected to the hub's
//! query socket. Used by engines to register and by clients to ask about
//! engines and tasks.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{HubError, Result};
use crate::protocol::messages::{
    self, ConnectionReply, DbQuery, DbReply, HistoryReply, LoadReply, LoadRequest, PurgeReply,
    PurgeRequest, QueueStatusReply, QueueStatusRequest, Registration, RegistrationAck,
    ResubmitReply, ResubmitRequest, ResultReply, ResultRequest, ShutdownAck, Unregistration,
};
use crate::protocol::{Context, DealerSocket, EngineId, Message, QueryKind, Reply};

/// Configuration for a hub client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the hub's query socket
    pub hub_addr: String,
    /// Routing identity of this client
    pub identity: String,
    /// How long to wait for a reply
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_addr: "tcp://127.0.0.1:5012".into(),
            identity: uuid::Uuid::new_v4().to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Hub client
pub struct HubClient {
    config: ClientConfig,
    dealer: DealerSocket,
}

impl HubClient {
    pub fn connect(ctx: &Context, config: ClientConfig) -> Self {
        debug!("Connecting `{}' to hub at {}", config.identity, config.hub_addr);
        let dealer = DealerSocket::connect(ctx, &config.hub_addr, &config.identity);
        Self { config, dealer }
    }

    pub fn identity(&self) -> &str {
        self.dealer.identity()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `[tag, payload]`
    pub fn send_request<T: Serialize>(&self, kind: QueryKind, payload: &T) -> Result<()> {
        self.send_raw(messages::query(kind, payload)?)
    }

    /// Send prebuilt frames as-is
    pub fn send_raw(&self, msg: Message) -> Result<()> {
        if self.dealer.send(msg) {
            Ok(())
        } else {
            Err(HubError::PeerUnreachable {
                identity: self.config.hub_addr.clone(),
            })
        }
    }

    /// Wait for the reply to `kind`; returns its content and any trailing frames
    pub fn recv_reply<R: DeserializeOwned>(&self, kind: QueryKind) -> Result<(R, Vec<Bytes>)> {
        let msg = self.dealer.recv_timeout(self.config.request_timeout)?;
        let tag = msg.str_at(0)?;
        if tag != kind.reply_tag() {
            warn!("Expected {} but got `{}'", kind.reply_tag(), tag);
            return Err(HubError::UnknownMessageType {
                tag: tag.to_string(),
            });
        }
        let content = msg.decode_at::<Reply<R>>(1)?.into_result()?;
        Ok((content, msg.frames_from(2).to_vec()))
    }

    /// Send a request and wait for its reply
    pub fn request<T: Serialize, R: DeserializeOwned>(&self, kind: QueryKind, payload: &T) -> Result<R> {
        self.send_request(kind, payload)?;
        Ok(self.recv_reply(kind)?.0)
    }

    /// Register an engine; blocks until its heart has been seen
    pub fn register(&self, registration: &Registration) -> Result<EngineId> {
        let ack: RegistrationAck = self.request(QueryKind::Registration, registration)?;
        Ok(ack.id)
    }

    pub fn unregister(&self, queue: &str) -> Result<EngineId> {
        let ack: RegistrationAck = self.request(
            QueryKind::Unregistration,
            &Unregistration {
                queue: queue.to_string(),
            },
        )?;
        Ok(ack.id)
    }

    pub fn load(&self, targets: Option<Vec<EngineId>>) -> Result<LoadReply> {
        self.request(QueryKind::Load, &LoadRequest { targets })
    }

    pub fn queue_status(&self, targets: Option<Vec<EngineId>>, verbose: bool) -> Result<QueueStatusReply> {
        self.request(QueryKind::QueueStatus, &QueueStatusRequest { targets, verbose })
    }

    pub fn purge(&self, request: &PurgeRequest) -> Result<usize> {
        let reply: PurgeReply = self.request(QueryKind::Purge, request)?;
        Ok(reply.purged)
    }

    /// Status of `msg_ids` plus, unless `status_only`, the completed payloads
    pub fn results(&self, msg_ids: &[String], status_only: bool) -> Result<(ResultReply, Vec<Bytes>)> {
        self.send_request(
            QueryKind::Results,
            &ResultRequest {
                msg_ids: msg_ids.to_vec(),
                status_only,
            },
        )?;
        self.recv_reply(QueryKind::Results)
    }

    pub fn history(&self) -> Result<Vec<String>> {
        let reply: HistoryReply = self.request(QueryKind::History, &())?;
        Ok(reply.history)
    }

    pub fn db(&self, query: &DbQuery) -> Result<DbReply> {
        self.request(QueryKind::Db, query)
    }

    pub fn resubmit(&self, msg_ids: &[String]) -> Result<Vec<String>> {
        let reply: ResubmitReply = self.request(
            QueryKind::Resubmit,
            &ResubmitRequest {
                msg_ids: msg_ids.to_vec(),
            },
        )?;
        Ok(reply.resubmitted)
    }

    /// Ask the hub to stop; returns the delay before it does
    pub fn shutdown_hub(&self) -> Result<Duration> {
        let ack: ShutdownAck = self.request(QueryKind::Shutdown, &())?;
        Ok(Duration::from_millis(ack.delay_ms))
    }

    pub fn connection(&self) -> Result<ConnectionReply> {
        self.request(QueryKind::Connection, &())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouterSocket;

    fn client(ctx: &Context) -> HubClient {
        HubClient::connect(
            ctx,
            ClientConfig {
                hub_addr: "inproc://hub".into(),
                identity: "c1".into(),
                request_timeout: Duration::from_millis(200),
            },
        )
    }

    #[test]
    fn test_unreachable_hub() {
        let ctx = Context::new();
        let client = client(&ctx);
        assert!(matches!(
            client.history(),
            Err(HubError::PeerUnreachable { .. })
        ));
    }

    #[test]
    fn test_error_reply_becomes_remote() {
        let ctx = Context::new();
        let hub = RouterSocket::bind(&ctx, "inproc://hub").unwrap();
        let client = client(&ctx);
        client.send_request(QueryKind::Purge, &PurgeRequest::default()).unwrap();

        let request = hub.recv_timeout(Duration::from_millis(200)).unwrap();
        let identity = request.frame(0).unwrap().clone();
        let err = HubError::TaskPending { msg_id: "t1".into() };
        hub.send(messages::reply::<PurgeReply>(identity, QueryKind::Purge, &Reply::from_error(&err)).unwrap())
            .unwrap();

        let reply = client.recv_reply::<PurgeReply>(QueryKind::Purge);
        assert!(matches!(reply, Err(HubError::Remote { ref ename, .. }) if ename == "TaskPending"));
    }

    #[test]
    fn test_mismatched_reply_tag() {
        let ctx = Context::new();
        let hub = RouterSocket::bind(&ctx, "inproc://hub").unwrap();
        let client = client(&ctx);
        hub.send(
            messages::reply(
                Bytes::from_static(b"c1"),
                QueryKind::Load,
                &Reply::Ok(LoadReply::new()),
            )
            .unwrap(),
        )
        .unwrap();
        assert!(matches!(
            client.recv_reply::<HistoryReply>(QueryKind::History),
            Err(HubError::UnknownMessageType { .. })
        ));
    }

    #[test]
    fn test_times_out_without_reply() {
        let ctx = Context::new();
        let _hub = RouterSocket::bind(&ctx, "inproc://hub").unwrap();
        let client = client(&ctx);
        assert!(matches!(client.connection(), Err(HubError::Timeout { .. })));
    }
}
