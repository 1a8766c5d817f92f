//! A live connection admitted into a room.
//!
//! The connection task owns the socket; the registry only holds the sending
//! side of the member's bounded outbound queue. Fan-out never awaits a
//! member: it either enqueues or records a failure.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Unique member identifier.
pub type MemberId = Uuid;

/// Liveness of a member's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberState {
    Open = 0,
    /// Eviction or close is underway; no further deliveries
    Closing = 1,
    Closed = 2,
}

impl MemberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a single delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Member is CLOSING or CLOSED; skipped, not a failure
    NotOpen,
    /// Outbound queue at capacity (slow reader)
    QueueFull,
    /// Connection task is gone
    Disconnected,
}

#[derive(Debug)]
pub struct Member {
    id: MemberId,
    room: String,
    peer_addr: Option<SocketAddr>,
    state: AtomicU8,
    outbound: mpsc::Sender<Message>,
    evicted: Notify,
}

impl Member {
    pub fn new(room: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            peer_addr: None,
            state: AtomicU8::new(MemberState::Open as u8),
            outbound,
            evicted: Notify::new(),
        }
    }

    /// Attach the remote address for logging.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Key of the room this member belongs to.
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> MemberState {
        MemberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == MemberState::Open
    }

    /// OPEN → CLOSING. Returns false if the member was already leaving.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                MemberState::Open as u8,
                MemberState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Any state → CLOSED and wake the connection task.
    ///
    /// Returns true exactly once per member; the caller that sees true owns
    /// the cleanup.
    pub(crate) fn mark_closed(&self) -> bool {
        let previous = self.state.swap(MemberState::Closed as u8, Ordering::AcqRel);
        if previous == MemberState::Closed as u8 {
            return false;
        }
        self.evicted.notify_one();
        true
    }

    /// Enqueue a frame without waiting.
    pub fn try_deliver(&self, frame: Message) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::NotOpen);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    /// Resolves once the relay has closed this member.
    pub async fn closed(&self) {
        self.evicted.notified().await
    }
}
