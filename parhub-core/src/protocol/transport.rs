//! In-process addressable transport
//!
//! Sockets meet at string addresses inside a shared [`Context`]. Every socket
//! owns an inbox channel; the reactor multiplexes readiness over those
//! inboxes. Delivery is best-effort: a message for an address nobody is bound
//! to is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::message::Message;
use crate::error::{HubError, Result};

/// Receiving half of a socket, registered with a reactor
pub type Inbox = Receiver<Message>;

#[derive(Default)]
struct Slot {
    /// Inbox of the socket bound here (router or sink subscriber)
    bound: Option<Sender<Message>>,
    /// Connected dealers by routing identity
    peers: HashMap<Bytes, Sender<Message>>,
    /// Connected subscribers
    subscribers: Vec<Sender<Message>>,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Shared address space
#[derive(Clone, Default)]
pub struct Context {
    slots: Arc<Mutex<HashMap<String, SlotRef>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, address: &str) -> SlotRef {
        self.slots
            .lock()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn bind_inbox(&self, address: &str, tx: &Sender<Message>) -> Result<SlotRef> {
        let slot = self.slot(address);
        {
            let mut guard = slot.lock();
            if guard.bound.is_some() {
                return Err(HubError::AddressInUse {
                    address: address.to_string(),
                });
            }
            guard.bound = Some(tx.clone());
        }
        Ok(slot)
    }

    /// Whether some socket is bound at `address`
    pub fn is_bound(&self, address: &str) -> bool {
        self.slots
            .lock()
            .get(address)
            .map(|slot| slot.lock().bound.is_some())
            .unwrap_or(false)
    }
}

fn release(slots: &[(String, SlotRef)], tx: &Sender<Message>) {
    for (_, slot) in slots {
        let mut guard = slot.lock();
        if guard.bound.as_ref().is_some_and(|b| b.same_channel(tx)) {
            guard.bound = None;
        }
    }
}

fn recv_timeout(inbox: &Inbox, timeout: Duration, what: &str) -> Result<Message> {
    match inbox.recv_timeout(timeout) {
        Ok(msg) => Ok(msg),
        Err(RecvTimeoutError::Timeout) => Err(HubError::Timeout {
            what: what.to_string(),
            after_ms: timeout.as_millis() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(HubError::ChannelClosed {
            endpoint: what.to_string(),
        }),
    }
}

fn try_recv(inbox: &Inbox) -> Option<Message> {
    match inbox.try_recv() {
        Ok(msg) => Some(msg),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
}

/// Identity-routed server socket
///
/// Inbound messages carry the sender's identity as their first frame;
/// outbound messages are routed by their first frame.
pub struct RouterSocket {
    tx: Sender<Message>,
    inbox: Inbox,
    slots: Vec<(String, SlotRef)>,
}

impl RouterSocket {
    /// Bind a router at `address`
    pub fn bind(ctx: &Context, address: &str) -> Result<Self> {
        let (tx, inbox) = channel::unbounded();
        let slot = ctx.bind_inbox(address, &tx)?;
        Ok(Self {
            tx,
            inbox,
            slots: vec![(address.to_string(), slot)],
        })
    }

    /// Additionally listen on `address`
    pub fn bind_also(&mut self, ctx: &Context, address: &str) -> Result<()> {
        let slot = ctx.bind_inbox(address, &self.tx)?;
        self.slots.push((address.to_string(), slot));
        Ok(())
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.slots.iter().map(|(addr, _)| addr.clone()).collect()
    }

    /// Route `msg` to the peer named by its first frame
    pub fn send(&self, mut msg: Message) -> Result<()> {
        let identity = msg.pop_front().ok_or(HubError::MissingFrame { index: 0 })?;
        for (_, slot) in &self.slots {
            let mut guard = slot.lock();
            if let Some(peer) = guard.peers.get(&identity) {
                if peer.send(msg.clone()).is_ok() {
                    return Ok(());
                }
                guard.peers.remove(&identity);
            }
        }
        Err(HubError::PeerUnreachable {
            identity: String::from_utf8_lossy(&identity).into_owned(),
        })
    }

    pub fn try_recv(&self) -> Option<Message> {
        try_recv(&self.inbox)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        recv_timeout(&self.inbox, timeout, "router")
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        release(&self.slots, &self.tx);
    }
}

/// Identity-carrying client socket connected to a router
pub struct DealerSocket {
    identity: Bytes,
    inbox: Inbox,
    slot: SlotRef,
    address: String,
}

impl DealerSocket {
    /// Connect to the router at `address` under `identity`
    pub fn connect(ctx: &Context, address: &str, identity: &str) -> Self {
        let (tx, inbox) = channel::unbounded();
        let slot = ctx.slot(address);
        let identity = Bytes::copy_from_slice(identity.as_bytes());
        if slot.lock().peers.insert(identity.clone(), tx).is_some() {
            warn!(
                "Dealer identity `{}' reconnected to {}",
                String::from_utf8_lossy(&identity),
                address
            );
        }
        Self {
            identity,
            inbox,
            slot,
            address: address.to_string(),
        }
    }

    pub fn identity(&self) -> &str {
        std::str::from_utf8(&self.identity).unwrap_or_default()
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    /// Send to the bound router; returns false if the message was dropped
    pub fn send(&self, mut msg: Message) -> bool {
        msg.push_front(self.identity.clone());
        let bound = self.slot.lock().bound.clone();
        match bound {
            Some(tx) if tx.send(msg).is_ok() => true,
            _ => {
                debug!("Nothing bound at {}, dropping message", self.address);
                false
            }
        }
    }

    pub fn try_recv(&self) -> Option<Message> {
        try_recv(&self.inbox)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        recv_timeout(&self.inbox, timeout, &self.address)
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.slot.lock().peers.remove(&self.identity);
    }
}

enum PubTarget {
    /// Broadcast to every subscriber connected at these addresses
    Bound(Vec<SlotRef>),
    /// Push into the sink subscriber bound at this address
    Connected(SlotRef),
}

/// Broadcast socket
pub struct PubSocket {
    target: PubTarget,
}

impl PubSocket {
    /// Publish to subscribers connecting at `address`
    pub fn bind(ctx: &Context, address: &str) -> Self {
        Self {
            target: PubTarget::Bound(vec![ctx.slot(address)]),
        }
    }

    /// Publish into the subscriber bound at `address`
    pub fn connect(ctx: &Context, address: &str) -> Self {
        Self {
            target: PubTarget::Connected(ctx.slot(address)),
        }
    }

    /// Send to every reachable subscriber, returning how many got it
    pub fn send(&self, msg: Message) -> usize {
        match &self.target {
            PubTarget::Bound(slots) => {
                let mut delivered = 0;
                for slot in slots {
                    slot.lock().subscribers.retain(|sub| {
                        let ok = sub.send(msg.clone()).is_ok();
                        delivered += usize::from(ok);
                        ok
                    });
                }
                delivered
            }
            PubTarget::Connected(slot) => {
                let bound = slot.lock().bound.clone();
                match bound {
                    Some(tx) if tx.send(msg).is_ok() => 1,
                    _ => 0,
                }
            }
        }
    }
}

/// Subscriber socket
pub struct SubSocket {
    tx: Sender<Message>,
    inbox: Inbox,
    bound: Vec<(String, SlotRef)>,
}

impl SubSocket {
    /// Subscribe to the publisher at `address`
    pub fn connect(ctx: &Context, address: &str) -> Self {
        let (tx, inbox) = channel::unbounded();
        ctx.slot(address).lock().subscribers.push(tx.clone());
        Self {
            tx,
            inbox,
            bound: Vec::new(),
        }
    }

    /// Bind a sink that connected publishers push into
    pub fn bind(ctx: &Context, address: &str) -> Result<Self> {
        let (tx, inbox) = channel::unbounded();
        let slot = ctx.bind_inbox(address, &tx)?;
        Ok(Self {
            tx,
            inbox,
            bound: vec![(address.to_string(), slot)],
        })
    }

    /// Additionally bind a sink at `address`
    pub fn bind_also(&mut self, ctx: &Context, address: &str) -> Result<()> {
        let slot = ctx.bind_inbox(address, &self.tx)?;
        self.bound.push((address.to_string(), slot));
        Ok(())
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn try_recv(&self) -> Option<Message> {
        try_recv(&self.inbox)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        recv_timeout(&self.inbox, timeout, "subscriber")
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        release(&self.bound, &self.tx);
    }
}
