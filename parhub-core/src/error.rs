//! Error types for the hub
//!
//! Error taxonomy covering transport, message decoding, registration,
//! and task ledger faults.

use thiserror::Error;

/// Primary error type for all hub operations
#[derive(Debug, Error)]
pub enum HubError {
    // ========== Transport Errors ==========

    /// Another socket already owns this address
    #[error("Address already bound: {address}")]
    AddressInUse { address: String },

    /// No peer with this routing identity is connected
    #[error("Peer `{identity}' is not reachable")]
    PeerUnreachable { identity: String },

    /// Endpoint was registered twice with the same reactor
    #[error("Endpoint `{name}' already registered")]
    DuplicateEndpoint { name: String },

    /// Waiting for a reply took too long
    #[error("Timed out after {after_ms} ms waiting for {what}")]
    Timeout { what: String, after_ms: u64 },

    /// The other end of a channel went away
    #[error("Channel closed: {endpoint}")]
    ChannelClosed { endpoint: String },

    // ========== Protocol Errors ==========

    /// Message is shorter than the handler expects
    #[error("Missing frame {index}")]
    MissingFrame { index: usize },

    /// Frame that should hold text does not
    #[error("Frame {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    /// Type tag not present in the dispatch table
    #[error("Unknown message type `{tag}'")]
    UnknownMessageType { tag: String },

    /// Payload frame could not be (de)serialized
    #[error("Malformed payload: {0}")]
    Codec(#[from] serde_json::Error),

    // ========== Registration Errors ==========

    /// Queue identity collides with a pending or active engine
    #[error("Queue id `{queue}' in use")]
    QueueInUse { queue: String },

    /// Heart identity collides with a pending or active engine
    #[error("Heart id `{heart}' in use")]
    HeartInUse { heart: String },

    /// No such engine (by id or queue identity)
    #[error("Unknown engine: {engine}")]
    UnknownEngine { engine: String },

    /// The hub answered a registration with an error
    #[error("Registration rejected: {reason}")]
    RegistrationRejected { reason: String },

    // ========== Ledger Errors ==========

    /// No such task id
    #[error("unknown message id: {msg_id}")]
    UnknownTask { msg_id: String },

    /// Task is still outstanding
    #[error("Task {msg_id} is still pending")]
    TaskPending { msg_id: String },

    /// Task has not completed yet and cannot be resubmitted
    #[error("Task {msg_id} has not completed")]
    TaskNotDone { msg_id: String },

    // ========== Runtime Errors ==========

    /// Hub answered a query with an error reply
    #[error("{ename}: {reason}")]
    Remote { ename: String, reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    /// Returns true if the offending message should just be logged and dropped
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            HubError::MissingFrame { .. }
                | HubError::InvalidUtf8 { .. }
                | HubError::UnknownMessageType { .. }
                | HubError::Codec(_)
        )
    }

    /// Returns true if the requester gets an explicit error reply for this
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            HubError::QueueInUse { .. }
                | HubError::HeartInUse { .. }
                | HubError::UnknownEngine { .. }
                | HubError::UnknownTask { .. }
                | HubError::TaskPending { .. }
                | HubError::TaskNotDone { .. }
        )
    }

    /// Short stable name carried in error replies
    pub fn ename(&self) -> &'static str {
        match self {
            HubError::AddressInUse { .. } => "AddressInUse",
            HubError::PeerUnreachable { .. } => "PeerUnreachable",
            HubError::DuplicateEndpoint { .. } => "DuplicateEndpoint",
            HubError::Timeout { .. } => "Timeout",
            HubError::ChannelClosed { .. } => "ChannelClosed",
            HubError::MissingFrame { .. } => "MissingFrame",
            HubError::InvalidUtf8 { .. } => "InvalidUtf8",
            HubError::UnknownMessageType { .. } => "UnknownMessageType",
            HubError::Codec(_) => "Codec",
            HubError::QueueInUse { .. } => "QueueInUse",
            HubError::HeartInUse { .. } => "HeartInUse",
            HubError::UnknownEngine { .. } => "UnknownEngine",
            HubError::RegistrationRejected { .. } => "RegistrationRejected",
            HubError::UnknownTask { .. } => "UnknownTask",
            HubError::TaskPending { .. } => "TaskPending",
            HubError::TaskNotDone { .. } => "TaskNotDone",
            HubError::Remote { .. } => "Remote",
            HubError::Internal { .. } => "Internal",
        }
    }
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
