//! Connection registry: room key → live members.
//!
//! ```text
//! RoomRegistry
//!   rooms: RwLock<HashMap<key, Arc<Room>>>     short-lived: lookup / create / delete
//!            │
//!            ├── Room "/r1"  Mutex<Membership>  admit · remove · fan-out
//!            └── Room "/r2"  Mutex<Membership>
//! ```
//!
//! Mutations on one room are serialized by that room's mutex, so the counts
//! carried by join/leave frames are always the true live count. Different
//! rooms never share a lock. The map lock is never taken while a room lock
//! is held.
//!
//! A room that drops to zero members is marked closed before it leaves the
//! map; an admit that raced with the deletion sees the flag and retries
//! against a fresh room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{fan_out, DeliveryReport};
use crate::member::{Member, MemberId};
use crate::protocol::ControlFrame;

/// Member set of one room. Only reachable through the room's mutex.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    pub(crate) members: HashMap<MemberId, Arc<Member>>,
    /// Set when the room went empty and is being (or has been) deleted
    pub(crate) closed: bool,
}

/// A named group of connections sharing one collaboration session.
#[derive(Debug)]
pub struct Room {
    key: String,
    pub(crate) membership: Mutex<Membership>,
}

impl Room {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            membership: Mutex::new(Membership::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn member_count(&self) -> usize {
        self.membership.lock().await.members.len()
    }

    /// Snapshot of the current members.
    pub async fn members(&self) -> Vec<Arc<Member>> {
        self.membership.lock().await.members.values().cloned().collect()
    }

    pub async fn has_member(&self, id: &MemberId) -> bool {
        self.membership.lock().await.members.contains_key(id)
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().await
    }
}

/// Owns every room in the process.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection into `room_key`, creating the room if needed.
    ///
    /// The new member receives `connected` with the post-admission count,
    /// then every other member receives `user_joined` with the same count.
    pub async fn admit(&self, room_key: &str, outbound: mpsc::Sender<Message>) -> Arc<Member> {
        self.admit_member(Member::new(room_key, outbound)).await
    }

    /// Admit an already-built member. Its room key decides the room.
    pub async fn admit_member(&self, member: Member) -> Arc<Member> {
        let member = Arc::new(member);
        let key = member.room().to_string();

        let failed = loop {
            let room = self.get_or_create(&key).await;
            let mut membership = room.lock().await;
            if membership.closed {
                // Deleted between lookup and lock; the next lookup creates a fresh room.
                continue;
            }

            membership.members.insert(member.id(), member.clone());
            let count = membership.members.len();

            let mut failed = Vec::new();
            if let Some(ack) = encode_control(&ControlFrame::connected(&key, count)) {
                if let Err(e) = member.try_deliver(ack) {
                    log::warn!("Could not acknowledge {} in room {key:?}: {e:?}", member.id());
                    if member.begin_close() {
                        failed.push(member.clone());
                    }
                }
            }

            if let Some(joined) = encode_control(&ControlFrame::user_joined(&key, count)) {
                let report = fan_out(membership.members.values(), &joined, Some(member.id()));
                failed.extend(report.failed);
            }

            log::info!(
                "Member {} joined room {key:?} ({count} connection{})",
                member.id(),
                if count == 1 { "" } else { "s" }
            );
            break failed;
        };

        self.evict(failed).await;
        member
    }

    /// Remove a member from its room. Removing twice is a no-op.
    ///
    /// Remaining members receive `user_left` with the post-removal count;
    /// a room left empty is deleted. Members whose `user_left` delivery
    /// fails are removed the same way.
    pub async fn remove(&self, member: &Arc<Member>) {
        self.evict(vec![member.clone()]).await;
    }

    /// Remove every member in `pending`, plus anyone who fails delivery of
    /// the resulting `user_left` frames.
    pub(crate) async fn evict(&self, mut pending: Vec<Arc<Member>>) {
        while let Some(member) = pending.pop() {
            if !member.mark_closed() {
                continue;
            }
            pending.extend(self.detach(&member).await);
        }
    }

    async fn detach(&self, member: &Member) -> Vec<Arc<Member>> {
        let Some(room) = self.room_of(member.room()).await else {
            return Vec::new();
        };

        let (failed, emptied) = {
            let mut membership = room.lock().await;
            if membership.members.remove(&member.id()).is_none() {
                return Vec::new();
            }

            let count = membership.members.len();
            log::info!(
                "Member {} left room {:?} ({count} remaining)",
                member.id(),
                room.key()
            );

            if count == 0 {
                membership.closed = true;
                (Vec::new(), true)
            } else {
                let failed = encode_control(&ControlFrame::user_left(room.key(), count))
                    .map(|left| fan_out(membership.members.values(), &left, None).failed)
                    .unwrap_or_default();
                (failed, false)
            }
        };

        if emptied {
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(room.key())
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(room.key());
                log::info!("Room {:?} removed (empty)", room.key());
            }
        }

        failed
    }

    /// Broadcast a pre-encoded frame into `room_key` and evict members whose
    /// delivery failed. A missing room yields an empty report.
    pub async fn broadcast(
        &self,
        room_key: &str,
        frame: &Message,
        exclude: Option<MemberId>,
    ) -> DeliveryReport {
        let Some(room) = self.room_of(room_key).await else {
            return DeliveryReport::default();
        };

        let report = room.broadcast(frame, exclude).await;
        if !report.failed.is_empty() {
            self.evict(report.failed.clone()).await;
        }
        report
    }

    /// Side-effect-free lookup.
    pub async fn room_of(&self, room_key: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_key).cloned()
    }

    async fn get_or_create(&self, room_key: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_key) {
            return room.clone();
        }

        let room = Arc::new(Room::new(room_key));
        rooms.insert(room_key.to_string(), room.clone());
        log::info!("Room {room_key:?} created");
        room
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_keys(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

fn encode_control(frame: &ControlFrame) -> Option<Message> {
    match frame.encode() {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            log::error!("Failed to encode {frame:?}: {e}");
            None
        }
    }
}
