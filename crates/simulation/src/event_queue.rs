//! Ordering key of the simulation's event queue.

use palisade_core::EventPriority;
use std::time::Duration;

/// Events fire by time, then priority, then insertion order.
///
/// The sequence number is unique per runner, so two keys never compare
/// equal and rescheduling an event moves it behind everything already
/// queued at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, priority: EventPriority, sequence: u64) -> Self {
        Self {
            time,
            priority,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_order_is_time_then_priority_then_sequence() {
        let mut queue = BTreeMap::new();
        let at = Duration::from_millis(5);
        queue.insert(EventKey::new(at, EventPriority::Client, 1), "client");
        queue.insert(EventKey::new(at, EventPriority::Internal, 3), "internal");
        queue.insert(EventKey::new(at, EventPriority::Internal, 2), "internal-first");
        queue.insert(EventKey::new(Duration::from_millis(1), EventPriority::Client, 4), "early");

        let order: Vec<_> = queue.into_values().collect();
        assert_eq!(order, vec!["early", "internal-first", "internal", "client"]);
    }
}
