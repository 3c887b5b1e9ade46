//! Event types delivered to a replica.

use crate::TimerId;
use palisade_messages::Message;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: protocol traffic from other replicas.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// Queue partition an event is served from.
///
/// Unrelated traffic lives in separate queues so a backlog in one cannot
/// head-of-line block another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkCategory {
    Client,
    General,
    Execution,
    Checkpoint,
    Timer,
}

impl WorkCategory {
    pub const ALL: [WorkCategory; 5] = [
        WorkCategory::Client,
        WorkCategory::General,
        WorkCategory::Execution,
        WorkCategory::Checkpoint,
        WorkCategory::Timer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkCategory::Client => "client",
            WorkCategory::General => "general",
            WorkCategory::Execution => "execution",
            WorkCategory::Checkpoint => "checkpoint",
            WorkCategory::Timer => "timer",
        }
    }
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    Timer(TimerId),

    // ═══════════════════════════════════════════════════════════════════════
    // Messages (priority: by kind)
    // Received from the network, from clients, or handed to ourselves
    // ═══════════════════════════════════════════════════════════════════════
    Message(Message),
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        Event::Message(message)
    }
}

impl Event {
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Timer(_) => EventPriority::Timer,
            Event::Message(Message::ExecuteSignal(_)) => EventPriority::Internal,
            Event::Message(Message::ClientBatch(_)) => EventPriority::Client,
            Event::Message(_) => EventPriority::Network,
        }
    }

    pub fn category(&self) -> WorkCategory {
        match self {
            Event::Timer(_) => WorkCategory::Timer,
            Event::Message(Message::ClientBatch(_)) => WorkCategory::Client,
            Event::Message(Message::ExecuteSignal(_)) => WorkCategory::Execution,
            Event::Message(Message::CheckpointVote(_)) => WorkCategory::Checkpoint,
            Event::Message(_) => WorkCategory::General,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Timer(TimerId::ViewChange) => "ViewChangeTimer",
            Event::Message(message) => message.type_name(),
        }
    }
}
