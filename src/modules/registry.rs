use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::modules::lock;
use crate::modules::task::TaskId;

#[derive(Debug)]
struct Published {
    text: String,
    published_at: Duration,
}

/// Completed texts waiting to be collected, keyed by task id. The worker
/// publishes, the scheduler polls; each result is handed out exactly once.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    results: Mutex<HashMap<TaskId, Published>>,
    ready: Condvar,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, task_id: TaskId, text: String, at: Duration) {
        let mut results = lock(&self.results);
        results.insert(
            task_id,
            Published {
                text,
                published_at: at,
            },
        );
        self.ready.notify_all();
    }

    /// Removes and returns the result for `task_id`, waiting up to `timeout`
    /// for it to appear.
    pub fn poll(&self, task_id: &TaskId, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut results = lock(&self.results);
        loop {
            if let Some(published) = results.remove(task_id) {
                return Some(published.text);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(results, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            results = guard;
        }
    }

    /// Drops results nobody collected within `max_age`.
    pub fn discard_stale(&self, now: Duration, max_age: Duration) -> usize {
        let mut results = lock(&self.results);
        let before = results.len();
        results.retain(|task_id, published| {
            let keep = now.saturating_sub(published.published_at) <= max_age;
            if !keep {
                debug!(task = %task_id, "discarding uncollected result");
            }
            keep
        });
        before - results.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.results).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::task::RequestKind;
    use std::sync::Arc;
    use std::thread;

    fn task(n: u64) -> TaskId {
        TaskId::generate(RequestKind::Reflection, "Mind-1", n)
    }

    #[test]
    fn result_is_collected_once() {
        let registry = PendingRegistry::new();
        let id = task(1);
        registry.publish(id.clone(), "hello".into(), Duration::ZERO);

        assert_eq!(registry.poll(&id, Duration::ZERO), Some("hello".into()));
        assert_eq!(registry.poll(&id, Duration::from_millis(10)), None);
    }

    #[test]
    fn poll_waits_for_a_late_publisher() {
        let registry = Arc::new(PendingRegistry::new());
        let id = task(2);

        let publisher = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.publish(id, "late".into(), Duration::ZERO);
            })
        };

        assert_eq!(registry.poll(&id, Duration::from_secs(5)), Some("late".into()));
        publisher.join().unwrap();
    }

    #[test]
    fn stale_results_are_discarded() {
        let registry = PendingRegistry::new();
        registry.publish(task(3), "old".into(), Duration::from_secs(1));
        registry.publish(task(4), "new".into(), Duration::from_secs(500));

        assert_eq!(registry.discard_stale(Duration::from_secs(700), Duration::from_secs(600)), 1);
        assert_eq!(registry.len(), 1);
    }
}
