use chrono::{DateTime, Duration, Utc};
use salvage_core::Task;
use std::collections::{HashMap, VecDeque};

/// Terminal tasks, newest-retained. Bounded by count and by age, whichever
/// trips first.
#[derive(Debug)]
pub(crate) struct ResultStore {
    retention_count: usize,
    retention_age: Duration,
    order: VecDeque<String>,
    entries: HashMap<String, Task>,
}

impl ResultStore {
    pub fn new(retention_count: usize, retention_age: std::time::Duration) -> Self {
        Self {
            retention_count,
            retention_age: Duration::from_std(retention_age).unwrap_or(Duration::MAX),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, task: Task) {
        debug_assert!(task.state.is_terminal());
        if self.entries.insert(task.task_id.clone(), task.clone()).is_none() {
            self.order.push_back(task.task_id);
        }
        while self.entries.len() > self.retention_count {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.entries.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn prune_expired(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.order.front() {
            let expired = match self.entries.get(oldest) {
                Some(task) => task
                    .finished_at
                    .is_some_and(|finished| now - finished >= self.retention_age),
                // Evicted by the count bound; drop the stale order entry.
                None => true,
            };
            if !expired {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}
