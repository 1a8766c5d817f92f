//! Fan-out of one frame to the members of a room.
//!
//! Frames are encoded once and cloned per member (`Message` clones share the
//! underlying bytes). Each member gets the frame through its own bounded
//! queue via `try_send`, so one slow reader can never stall delivery to the
//! rest of the room: a full queue counts as a failed send and that member is
//! evicted.

use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

use crate::member::{DeliveryError, Member, MemberId};
use crate::registry::Room;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Members the frame was enqueued for
    pub delivered: usize,
    /// Members passed over because they were not OPEN
    pub skipped: usize,
    /// Members whose send failed; already moved to CLOSING
    pub failed: Vec<Arc<Member>>,
}

impl DeliveryReport {
    pub fn failed_ids(&self) -> Vec<MemberId> {
        self.failed.iter().map(|m| m.id()).collect()
    }
}

/// Deliver `frame` to every OPEN member except `exclude`.
///
/// Callers hold the room lock while iterating, which makes the member set a
/// consistent snapshot with respect to admit and remove.
pub(crate) fn fan_out<'a, I>(members: I, frame: &Message, exclude: Option<MemberId>) -> DeliveryReport
where
    I: IntoIterator<Item = &'a Arc<Member>>,
{
    let mut report = DeliveryReport::default();

    for member in members {
        if Some(member.id()) == exclude {
            continue;
        }
        match member.try_deliver(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::NotOpen) => report.skipped += 1,
            Err(e) => {
                log::warn!(
                    "Delivery to {} in room {:?} failed: {e:?}; evicting",
                    member.id(),
                    member.room()
                );
                if member.begin_close() {
                    report.failed.push(member.clone());
                }
            }
        }
    }

    report
}

impl Room {
    /// Deliver a frame to the room, skipping `exclude`.
    ///
    /// Failed members are only moved to CLOSING here. Callers outside the
    /// registry go through [`RoomRegistry::broadcast`](crate::registry::RoomRegistry::broadcast),
    /// which evicts them.
    pub(crate) async fn broadcast(&self, frame: &Message, exclude: Option<MemberId>) -> DeliveryReport {
        let membership = self.lock().await;
        fan_out(membership.members.values(), frame, exclude)
    }
}
