//! Payload types carried in message frames
//!
//! Everything here is serialized with serde_json into a single frame.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MonitorKind, QueryKind};
use crate::error::{HubError, Result};

/// Numeric engine id, assigned monotonically by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(pub u32);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue class of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Routed straight to a chosen engine
    Immediate,
    /// Handed to the scheduler, bound to an engine later
    Scheduled,
}

/// Coarse task status reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
}

// ============ Registration ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Heart identity that will answer pings
    pub heartbeat: String,
    /// Routing identity of the engine's task queue
    pub queue: String,
    /// Display name
    pub registration: String,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub id: EngineId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unregistration {
    pub queue: String,
}

/// Broadcast on the notification channel when an engine joins or leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineNotification {
    pub id: EngineId,
    pub queue: String,
    pub heartbeat: String,
    pub registration: String,
    pub services: Vec<String>,
}

// ============ Queries ============

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Engines to report on; `None` means every active engine
    #[serde(default)]
    pub targets: Option<Vec<EngineId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLoad {
    /// Outstanding tasks routed on the immediate lane
    pub queue: usize,
    /// Outstanding tasks routed on the scheduled lane
    pub tasks: usize,
}

pub type LoadReply = BTreeMap<EngineId, EngineLoad>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusRequest {
    #[serde(default)]
    pub targets: Option<Vec<EngineId>>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineQueueStatus {
    pub queue: usize,
    pub tasks: usize,
    pub completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusReply {
    pub engines: BTreeMap<EngineId, EngineQueueStatus>,
    pub unassigned: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub msg_ids: Vec<String>,
    #[serde(default)]
    pub engine_ids: Vec<EngineId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReply {
    pub purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRequest {
    pub msg_ids: Vec<String>,
    #[serde(default)]
    pub status_only: bool,
}

/// Per-task view handed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub msg_id: String,
    pub client: String,
    pub lane: Lane,
    pub status: TaskStatus,
    pub engine: Option<EngineId>,
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub resubmitted: Option<DateTime<Utc>>,
    /// Set when the result was synthesized after the engine died
    #[serde(default)]
    pub stranded: bool,
}

/// Reply to a result request; result payloads follow as trailing frames in
/// `msg_ids` order unless only the status was asked for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReply {
    pub pending: Vec<String>,
    pub completed: Vec<String>,
    pub results: BTreeMap<String, TaskSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryReply {
    pub history: Vec<String>,
}

/// Filter over the task ledger; every set field must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbQuery {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub engine: Option<EngineId>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub lane: Option<Lane>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbReply {
    pub records: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubmitRequest {
    pub msg_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubmitReply {
    pub resubmitted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownAck {
    pub delay_ms: u64,
}

/// Addresses a client needs to talk to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnectionInfo {
    pub registration: String,
    pub control: String,
    pub mux: String,
    pub task: String,
    pub task_scheme: String,
    pub iopub: String,
    pub notification: String,
}

/// Addresses an engine needs to join the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConnectionInfo {
    pub registration: String,
    pub control: String,
    pub mux: String,
    pub task: String,
    pub iopub: String,
    /// Ping (subscribe) and pong (send) addresses
    pub heartbeat: [String; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReply {
    pub client: ClientConnectionInfo,
    pub engines: BTreeMap<EngineId, String>,
}

/// Envelope for every query reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "lowercase")]
pub enum Reply<T> {
    Ok(T),
    Error { ename: String, reason: String },
}

impl<T> Reply<T> {
    pub fn from_error(err: &HubError) -> Self {
        Reply::Error {
            ename: err.ename().to_string(),
            reason: err.to_string(),
        }
    }

    /// Turn an error reply into `HubError::Remote`
    pub fn into_result(self) -> Result<T> {
        match self {
            Reply::Ok(content) => Ok(content),
            Reply::Error { ename, reason } => Err(HubError::Remote { ename, reason }),
        }
    }
}

// ============ Monitor traffic ============

/// Header of `in` / `intask` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequestHeader {
    pub msg_id: String,
    pub client: String,
    /// Queue identity of the target engine, when already chosen
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub submitted: Option<DateTime<Utc>>,
}

/// Header of `out` / `outtask` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultHeader {
    pub msg_id: String,
    /// Queue identity of the engine that produced the result
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

/// Header of `tracktask` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDestination {
    pub msg_id: String,
    pub engine: String,
}

/// Header of `iopub` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPubHeader {
    pub msg_id: String,
    pub stream: String,
    pub text: String,
}

// ============ Builders ============

/// `[tag, header, content]` for a task request on `lane`
pub fn task_request(lane: Lane, header: &TaskRequestHeader, content: Bytes) -> Result<Message> {
    let kind = match lane {
        Lane::Immediate => MonitorKind::QueueRequest,
        Lane::Scheduled => MonitorKind::TaskRequest,
    };
    Ok(Message::new()
        .with(kind.as_str())
        .with_json(header)?
        .with(content))
}

/// `[tag, header, result]` for a task result on `lane`
pub fn task_result(lane: Lane, header: &TaskResultHeader, result: Bytes) -> Result<Message> {
    let kind = match lane {
        Lane::Immediate => MonitorKind::QueueResult,
        Lane::Scheduled => MonitorKind::TaskResult,
    };
    Ok(Message::new()
        .with(kind.as_str())
        .with_json(header)?
        .with(result))
}

pub fn task_destination(msg_id: &str, engine_queue: &str) -> Result<Message> {
    Message::new()
        .with(MonitorKind::TaskDestination.as_str())
        .with_json(&TaskDestination {
            msg_id: msg_id.to_string(),
            engine: engine_queue.to_string(),
        })
}

pub fn iopub(msg_id: &str, stream: &str, text: &str) -> Result<Message> {
    Message::new().with(MonitorKind::IoPub.as_str()).with_json(&IoPubHeader {
        msg_id: msg_id.to_string(),
        stream: stream.to_string(),
        text: text.to_string(),
    })
}

/// `[tag, payload]` for a query
pub fn query<T: Serialize>(kind: QueryKind, payload: &T) -> Result<Message> {
    Message::new().with(kind.as_str()).with_json(payload)
}

/// `[identity, reply_tag, Reply<T>]`
pub fn reply<T: Serialize>(identity: Bytes, kind: QueryKind, content: &Reply<T>) -> Result<Message> {
    Message::new()
        .with(identity)
        .with(kind.reply_tag())
        .with_json(content)
}

/// Notification frames for a membership change
pub fn engine_notification(tag: &'static str, payload: &EngineNotification) -> Result<Message> {
    Message::new().with(tag).with_json(payload)
}
