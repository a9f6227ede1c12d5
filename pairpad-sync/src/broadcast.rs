//! Fan-out of one message to every member of a room except the sender.
//!
//! The message is encoded once and the shared text is queued into each
//! member's outbox. A member whose outbox rejects the frame is evicted:
//! unregistered from the room and closed. Evictions are returned in the
//! [`BroadcastReport`]; announcing them (`user_left`) is up to the caller,
//! so a broadcast never triggers another broadcast by itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::{CloseReason, ConnectionHandle, Frame};
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, ParticipantId};

/// A member removed because delivery to it failed.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub room_id: String,
    pub connection: ConnectionHandle,
    pub participant_id: ParticipantId,
    /// Members left in the room right after the removal
    pub remaining: usize,
}

/// Outcome of a single broadcast call.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Members the frame was queued for
    pub delivered: usize,
    pub evictions: Vec<Eviction>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// Room fan-out over a shared [`ConnectionRegistry`].
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver `event` to every member of `room_id` except `exclude`.
    ///
    /// Membership is snapshotted once; delivery happens outside the
    /// registry lock. A room with no entry is a no-op.
    pub fn broadcast(
        &self,
        room_id: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionHandle>,
    ) -> BroadcastReport {
        let kind = event.kind();
        let members = self.registry.members_of(room_id);
        if members.is_empty() {
            return BroadcastReport::default();
        }

        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {kind} for room {room_id}: {e}");
                return BroadcastReport::default();
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for member in members
            .into_iter()
            .filter(|m| exclude.map_or(true, |ex| ex.id() != m.id()))
        {
            match member.deliver(Frame::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!(
                        "Failed to deliver {kind} to connection {} in room {room_id}: {e}",
                        member.id()
                    );
                    failed.push(member);
                }
            }
        }

        let mut evictions = Vec::with_capacity(failed.len());
        if !failed.is_empty() {
            log::info!(
                "Evicting {} unreachable connection(s) from room {room_id}",
                failed.len()
            );
        }
        for connection in failed {
            connection.close(CloseReason::DELIVERY_FAILED);
            // Someone else may have removed it since the snapshot.
            if let Some(departure) = self.registry.unregister(&connection, room_id) {
                evictions.push(Eviction {
                    room_id: room_id.to_string(),
                    connection,
                    participant_id: departure.participant_id,
                    remaining: departure.remaining,
                });
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evictions.len() as u64, Ordering::Relaxed);

        log::trace!("Broadcast {kind} to {delivered} member(s) of room {room_id}");

        BroadcastReport {
            delivered,
            evictions,
        }
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Announce each eviction to the rest of its room with a `user_left`.
///
/// Announcements can evict further members; those are queued and
/// announced in turn until the queue drains.
pub fn announce_departures(broadcaster: &Broadcaster, evictions: Vec<Eviction>) {
    let mut pending = std::collections::VecDeque::from(evictions);
    while let Some(eviction) = pending.pop_front() {
        log::info!(
            "Participant {} evicted from room {}",
            eviction.participant_id,
            eviction.room_id
        );
        let report = broadcaster.broadcast(
            &eviction.room_id,
            ServerEvent::UserLeft {
                room_id: eviction.room_id.clone(),
                user_id: eviction.participant_id.into(),
                user_count: eviction.remaining,
            },
            None,
        );
        pending.extend(report.evictions);
    }
}
