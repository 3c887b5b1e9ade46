//! Partitioned work queues.
//!
//! One unbounded MPMC channel per [`WorkCategory`]. Any thread may push;
//! each worker role pops only from the categories it serves. A requeued
//! event goes to the back of its category.

use crossbeam::channel::{self, Receiver, Select, Sender};
use crossbeam::utils::Backoff;
use palisade_core::{Event, WorkCategory};
use std::time::Duration;
use tracing::trace;

/// Categories served by general workers, in poll order.
pub const GENERAL_CATEGORIES: &[WorkCategory] = &[
    WorkCategory::Timer,
    WorkCategory::General,
    WorkCategory::Client,
];

pub const EXECUTOR_CATEGORIES: &[WorkCategory] = &[WorkCategory::Execution];

pub const CHECKPOINT_CATEGORIES: &[WorkCategory] = &[WorkCategory::Checkpoint];

struct Lane {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

pub struct WorkQueues {
    lanes: Vec<Lane>,
}

impl std::fmt::Debug for WorkQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for category in WorkCategory::ALL {
            map.entry(&category.as_str(), &self.depth(category));
        }
        map.finish()
    }
}

impl Default for WorkQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueues {
    pub fn new() -> Self {
        let lanes = WorkCategory::ALL
            .iter()
            .map(|_| {
                let (tx, rx) = channel::unbounded();
                Lane { tx, rx }
            })
            .collect();
        Self { lanes }
    }

    fn lane(&self, category: WorkCategory) -> &Lane {
        &self.lanes[category as usize]
    }

    /// Push to the back of the event's category.
    pub fn push(&self, event: Event) {
        let category = event.category();
        trace!(category = category.as_str(), event = event.type_name(), "Enqueue");
        // Every lane keeps its own receiver, so the send cannot fail.
        let _ = self.lane(category).tx.send(event);
    }

    pub fn try_pop(&self, category: WorkCategory) -> Option<Event> {
        self.lane(category).rx.try_recv().ok()
    }

    /// First event available in `categories`, in the given order.
    pub fn try_pop_any(&self, categories: &[WorkCategory]) -> Option<Event> {
        categories
            .iter()
            .find_map(|category| self.try_pop(*category))
    }

    /// Wait for work in `categories`.
    ///
    /// Spins and yields with a [`Backoff`] first, then parks on the lanes
    /// for at most `park`. Returns `None` when nothing arrived in time.
    pub fn pop_wait(&self, categories: &[WorkCategory], park: Duration) -> Option<Event> {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if let Some(event) = self.try_pop_any(categories) {
                return Some(event);
            }
            backoff.snooze();
        }

        let mut select = Select::new();
        for category in categories {
            select.recv(&self.lane(*category).rx);
        }
        match select.ready_timeout(park) {
            // Another worker may win the race for the ready event.
            Ok(_) => self.try_pop_any(categories),
            Err(_) => None,
        }
    }

    pub fn depth(&self, category: WorkCategory) -> usize {
        self.lane(category).rx.len()
    }

    pub fn total_depth(&self) -> usize {
        self.lanes.iter().map(|lane| lane.rx.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::TimerId;
    use palisade_messages::{ClientBatch, ExecuteSignal, Message};
    use palisade_types::{BatchId, ClientId, ClientRequest, Digest, InstanceId, SeqNum, SeqRange, View};
    use std::sync::Arc;

    fn client_event(id: u64) -> Event {
        Event::Message(Message::ClientBatch(ClientBatch::new(
            ClientId(1),
            BatchId(id),
            vec![ClientRequest::noop(id)],
        )))
    }

    fn execute_event() -> Event {
        Event::Message(Message::ExecuteSignal(ExecuteSignal {
            view: View(0),
            instance: InstanceId(0),
            range: SeqRange::new(SeqNum(0), 1),
            digest: Digest::ZERO,
        }))
    }

    #[test]
    fn test_events_land_in_their_category() {
        let queues = WorkQueues::new();
        queues.push(client_event(1));
        queues.push(execute_event());
        queues.push(Event::Timer(TimerId::ViewChange));

        assert_eq!(queues.depth(WorkCategory::Client), 1);
        assert_eq!(queues.depth(WorkCategory::Execution), 1);
        assert_eq!(queues.total_depth(), 3);
        assert!(queues.try_pop_any(CHECKPOINT_CATEGORIES).is_none());
        assert!(queues.try_pop_any(EXECUTOR_CATEGORIES).is_some());
    }

    #[test]
    fn test_general_workers_poll_timers_first() {
        let queues = WorkQueues::new();
        queues.push(client_event(1));
        queues.push(Event::Timer(TimerId::ViewChange));
        assert_eq!(
            queues.try_pop_any(GENERAL_CATEGORIES),
            Some(Event::Timer(TimerId::ViewChange))
        );
    }

    #[test]
    fn test_requeue_goes_to_the_back() {
        let queues = WorkQueues::new();
        queues.push(client_event(1));
        queues.push(client_event(2));
        let first = queues.try_pop(WorkCategory::Client).unwrap();
        queues.push(first.clone());
        assert_eq!(queues.try_pop(WorkCategory::Client), Some(client_event(2)));
        assert_eq!(queues.try_pop(WorkCategory::Client), Some(first));
    }

    #[test]
    fn test_pop_wait_parks_boundedly() {
        let queues = WorkQueues::new();
        let start = std::time::Instant::now();
        assert!(queues
            .pop_wait(GENERAL_CATEGORIES, Duration::from_millis(20))
            .is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_pop_wait_wakes_on_push() {
        let queues = Arc::new(WorkQueues::new());
        let pusher = {
            let queues = queues.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                queues.push(execute_event());
            })
        };
        let mut event = None;
        for _ in 0..100 {
            event = queues.pop_wait(EXECUTOR_CATEGORIES, Duration::from_millis(50));
            if event.is_some() {
                break;
            }
        }
        pusher.join().unwrap();
        assert_eq!(event, Some(execute_event()));
    }
}
