//! Multi-frame messages and the closed sets of message kinds
//!
//! A message is a sequence of frames: routing/identity frames first, then a
//! string type tag, then zero or more payload frames.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HubError, Result};

/// A sequence of opaque frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Bytes>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Create a message from existing frames
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Append a frame, builder style
    pub fn with(mut self, frame: impl Into<Bytes>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Append a JSON-encoded payload frame, builder style
    pub fn with_json<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.push_json(payload)?;
        Ok(self)
    }

    /// Append a frame
    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// Append a JSON-encoded payload frame
    pub fn push_json<T: Serialize>(&mut self, payload: &T) -> Result<()> {
        self.frames.push(Bytes::from(serde_json::to_vec(payload)?));
        Ok(())
    }

    /// Prepend a frame (used for routing identities)
    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.insert(0, frame.into());
    }

    /// Remove and return the first frame
    pub fn pop_front(&mut self) -> Option<Bytes> {
        if self.frames.is_empty() {
            None
        } else {
            Some(self.frames.remove(0))
        }
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Raw frame at `index`
    pub fn frame(&self, index: usize) -> Result<&Bytes> {
        self.frames.get(index).ok_or(HubError::MissingFrame { index })
    }

    /// Frame at `index` read as UTF-8 text
    pub fn str_at(&self, index: usize) -> Result<&str> {
        let frame = self.frame(index)?;
        std::str::from_utf8(frame).map_err(|_| HubError::InvalidUtf8 { index })
    }

    /// Frame at `index` decoded as JSON
    pub fn decode_at<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        Ok(serde_json::from_slice(self.frame(index)?)?)
    }

    /// Frames after `index`
    pub fn frames_from(&self, index: usize) -> &[Bytes] {
        self.frames.get(index..).unwrap_or(&[])
    }
}

macro_rules! message_kinds {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every kind, in table order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire tag
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl FromStr for $name {
            type Err = HubError;

            fn from_str(tag: &str) -> Result<Self> {
                match tag {
                    $($tag => Ok($name::$variant),)+
                    other => Err(HubError::UnknownMessageType { tag: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

message_kinds! {
    /// Task and queue lifecycle events relayed by the queue devices
    MonitorKind {
        QueueRequest => "in",
        QueueResult => "out",
        TaskRequest => "intask",
        TaskResult => "outtask",
        TaskDestination => "tracktask",
        ControlRequest => "incontrol",
        ControlReply => "outcontrol",
        IoPub => "iopub",
    }
}

message_kinds! {
    /// Client queries and engine registration requests
    QueryKind {
        QueueStatus => "queue_request",
        Results => "result_request",
        History => "history_request",
        Db => "db_request",
        Purge => "purge_request",
        Load => "load_request",
        Resubmit => "resubmit_request",
        Shutdown => "shutdown_request",
        Registration => "registration_request",
        Unregistration => "unregistration_request",
        Connection => "connection_request",
    }
}

impl QueryKind {
    /// Tag of the reply sent back for this query
    pub fn reply_tag(&self) -> &'static str {
        match self {
            QueryKind::QueueStatus => "queue_reply",
            QueryKind::Results => "result_reply",
            QueryKind::History => "history_reply",
            QueryKind::Db => "db_reply",
            QueryKind::Purge => "purge_reply",
            QueryKind::Load => "load_reply",
            QueryKind::Resubmit => "resubmit_reply",
            QueryKind::Shutdown => "shutdown_reply",
            QueryKind::Registration => "registration_reply",
            QueryKind::Unregistration => "unregistration_reply",
            QueryKind::Connection => "connection_reply",
        }
    }
}

/// Notification tags broadcast to clients
pub mod notification {
    pub const REGISTRATION: &str = "registration_notification";
    pub const UNREGISTRATION: &str = "unregistration_notification";
    pub const SHUTDOWN: &str = "shutdown_notification";
}
