//! Interface to the in-process IPv6 stack.
//!
//! The stack is an opaque peer: the bridge pushes addresses, link state, and
//! inbound datagrams into it through [`Ip6Stack`], and the stack's callbacks
//! are surfaced to the bridge as buffered [`StackEvent`]s. Buffering keeps
//! the bridge reentrancy-safe: a stack call made from a kernel-event handler
//! may fire another callback before returning, and that callback lands on
//! the queue instead of recursing into the reconciler.

use std::net::Ipv6Addr;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::warn;

/// Error kinds surfaced by the stack.
///
/// `Already` and `NotFound` are the convergent steady state of mirrored
/// address tables and are treated as success by the reconciler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    #[error("already present")]
    Already,
    #[error("not found")]
    NotFound,
    #[error("out of message buffers")]
    NoBufs,
    #[error("stack failure")]
    Other,
}

/// Operations the bridge invokes on the stack.
///
/// Implementations are typically cheap handles into the embedding process's
/// stack instance; the bridge owns the handle for its lifetime.
pub trait Ip6Stack {
    /// Whether the stack's IPv6 processing is enabled.
    fn is_enabled(&self) -> bool;

    /// Enable or disable IPv6 processing.
    fn set_enabled(&mut self, enabled: bool) -> Result<(), StackError>;

    fn add_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<(), StackError>;

    fn remove_unicast(&mut self, addr: Ipv6Addr) -> Result<(), StackError>;

    fn subscribe_multicast(&mut self, addr: Ipv6Addr) -> Result<(), StackError>;

    fn unsubscribe_multicast(&mut self, addr: Ipv6Addr) -> Result<(), StackError>;

    /// Deliver one inbound IPv6 datagram. The stack takes ownership of the
    /// buffer on success and failure alike.
    fn send(&mut self, datagram: Vec<u8>) -> Result<(), StackError>;

    /// Toggle the stack's own ICMPv6 echo responder. The bridge disables it
    /// at init because the kernel interface answers pings.
    fn set_icmp_echo_enabled(&mut self, enabled: bool);

    /// Ask the stack to pass all multicast traffic up, for platforms where
    /// the bridge cannot learn group memberships from the kernel.
    fn set_multicast_promiscuous(&mut self, enabled: bool);
}

/// Notification flag bits carried by [`StackEvent::StateChanged`].
pub mod changed {
    /// The network interface state (IPv6 enabled/disabled) may have changed.
    pub const NETIF_STATE: u32 = 1 << 0;
}

/// A buffered stack callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// The stack adopted or dropped an address (unicast or multicast).
    AddressChanged {
        addr: Ipv6Addr,
        prefix_len: u8,
        added: bool,
    },
    /// The stack's state changed; `flags` is a notification bitmask.
    StateChanged { flags: u32 },
    /// The stack emitted an outbound IPv6 datagram.
    Received(Vec<u8>),
}

impl StackEvent {
    fn kind(&self) -> &'static str {
        match self {
            StackEvent::AddressChanged { .. } => "address-changed",
            StackEvent::StateChanged { .. } => "state-changed",
            StackEvent::Received(_) => "received",
        }
    }
}

const EVENT_CAPACITY: usize = 1024;

/// Sending half of the stack-event queue.
///
/// The embedding wires a clone of this into each of the stack's callback
/// registrations (receive, address-change, state-change). Events are drained
/// by [`crate::Netif::process`] on the next loop tick.
#[derive(Clone)]
pub struct StackEventSender {
    tx: Sender<StackEvent>,
}

impl StackEventSender {
    /// Enqueue one event. The queue is bounded; under pressure the newest
    /// event is dropped with a warning rather than blocking the stack.
    pub fn notify(&self, event: StackEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.kind(), "stack event queue full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub(crate) fn event_channel() -> (StackEventSender, Receiver<StackEvent>) {
    let (tx, rx) = bounded(EVENT_CAPACITY);
    (StackEventSender { tx }, rx)
}
