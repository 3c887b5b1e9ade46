//! Timer management for the replica runtime.
//!
//! Each timer is a tokio task that sleeps and then pushes
//! [`Event::Timer`] into the replica's timer queue. Setting a timer that
//! is already pending replaces it.

use crate::queues::WorkQueues;
use palisade_core::{Event, TimerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub struct TimerManager {
    handle: Handle,
    queues: Arc<WorkQueues>,
    timers: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("active", &self.active_count())
            .finish()
    }
}

impl TimerManager {
    /// Timers run on `handle` and fire into `queues`.
    pub fn new(handle: Handle, queues: Arc<WorkQueues>) -> Self {
        Self {
            handle,
            queues,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Set a timer that will fire after the given duration.
    pub fn set_timer(&self, id: TimerId, duration: Duration) {
        let queues = self.queues.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "Timer fired");
            queues.push(Event::Timer(id));
        });
        if let Some(previous) = self.timers.lock().insert(id, task) {
            previous.abort();
        }
        trace!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer. No-op if it is not pending.
    pub fn cancel_timer(&self, id: TimerId) {
        if let Some(task) = self.timers.lock().remove(&id) {
            task.abort();
            debug!(?id, "Timer cancelled");
        }
    }

    pub fn cancel_all(&self) {
        for (id, task) in self.timers.lock().drain() {
            task.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    /// Timers set and not cancelled, including ones that already fired.
    pub fn active_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::WorkCategory;

    fn wait_for_timer(queues: &WorkQueues, within: Duration) -> Option<Event> {
        queues.pop_wait(&[WorkCategory::Timer], within)
    }

    #[test]
    fn test_timer_fires_into_timer_queue() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queues = Arc::new(WorkQueues::new());
        let timers = TimerManager::new(runtime.handle().clone(), queues.clone());

        timers.set_timer(TimerId::ViewChange, Duration::from_millis(10));
        assert_eq!(
            wait_for_timer(&queues, Duration::from_secs(2)),
            Some(Event::Timer(TimerId::ViewChange))
        );
    }

    #[test]
    fn test_timer_cancel() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queues = Arc::new(WorkQueues::new());
        let timers = TimerManager::new(runtime.handle().clone(), queues.clone());

        timers.set_timer(TimerId::ViewChange, Duration::from_millis(50));
        timers.cancel_timer(TimerId::ViewChange);
        assert_eq!(timers.active_count(), 0);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(queues.depth(WorkCategory::Timer), 0);
    }

    #[test]
    fn test_timer_replace() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queues = Arc::new(WorkQueues::new());
        let timers = TimerManager::new(runtime.handle().clone(), queues.clone());

        timers.set_timer(TimerId::ViewChange, Duration::from_secs(30));
        timers.set_timer(TimerId::ViewChange, Duration::from_millis(10));
        assert_eq!(timers.active_count(), 1);
        assert!(wait_for_timer(&queues, Duration::from_secs(2)).is_some());
    }
}
