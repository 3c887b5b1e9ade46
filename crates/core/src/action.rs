//! Action types returned by a dispatcher.

use crate::{Event, TimerId};
use palisade_messages::Message;
use palisade_types::{ClientId, ReplicaId, ShardId};
use std::time::Duration;

/// Actions a replica wants its runner to perform.
///
/// Actions are **commands** - they describe something to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every replica of a shard except the sender.
    BroadcastToShard { shard: ShardId, message: Message },

    /// Send a message to a single replica.
    SendToReplica { to: ReplicaId, message: Message },

    /// Send a message to a client.
    SendToClient { client: ClientId, message: Message },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an event for this replica.
    EnqueueInternal { event: Event },
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::BroadcastToShard { .. } => "BroadcastToShard",
            Action::SendToReplica { .. } => "SendToReplica",
            Action::SendToClient { .. } => "SendToClient",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
        }
    }

    /// The carried message, for actions that carry one.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Action::BroadcastToShard { message, .. }
            | Action::SendToReplica { message, .. }
            | Action::SendToClient { message, .. } => Some(message),
            Action::EnqueueInternal {
                event: Event::Message(message),
            } => Some(message),
            _ => None,
        }
    }
}
