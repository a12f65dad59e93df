use salvage_core::{Task, TaskPriority, TaskState};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

/// Four FIFO bands, urgent first. Owned by the scheduler, which is the only
/// accessor; the shared depth gauge feeds `heartbeat_ack.pending_task_hint`.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    bands: [VecDeque<Task>; TaskPriority::COUNT],
    capacity: usize,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new(capacity: usize, depth: Arc<AtomicUsize>) -> Self {
        Self {
            bands: Default::default(),
            capacity,
            depth,
        }
    }

    /// Admission path for new submissions; fails at capacity and hands the
    /// task back to the caller.
    pub fn enqueue(&mut self, mut task: Task) -> Result<(), Task> {
        if self.len() >= self.capacity {
            return Err(task);
        }
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_back(task);
        self.update_depth();
        Ok(())
    }

    /// Head-of-band reinsertion after a dispatch failure. Not capacity
    /// checked: the task was already admitted.
    pub fn requeue_front(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_front(task);
        self.update_depth();
    }

    /// Tail reinsertion for retries, at the band of the original priority.
    pub fn requeue_back(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_back(task);
        self.update_depth();
    }

    /// Highest-priority, earliest-queued task accepted by the predicate.
    /// Scans strictly in band order so a lower-priority task is never
    /// returned while a higher-priority match exists.
    pub fn dequeue_matching<F>(&mut self, mut accept: F) -> Option<Task>
    where
        F: FnMut(&Task) -> bool,
    {
        for band_index in 0..self.bands.len() {
            if let Some(pos) = self.bands[band_index].iter().position(|task| accept(task)) {
                let task = self.bands[band_index].remove(pos);
                self.update_depth();
                return task;
            }
        }
        None
    }

    pub fn cancel(&mut self, task_id: &str) -> Option<Task> {
        for band_index in 0..self.bands.len() {
            if let Some(pos) = self.bands[band_index]
                .iter()
                .position(|task| task.task_id == task_id)
            {
                let task = self.bands[band_index].remove(pos);
                self.update_depth();
                return task;
            }
        }
        None
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.bands
            .iter()
            .flat_map(|band| band.iter())
            .find(|task| task.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            urgent: self.bands[TaskPriority::Urgent.band()].len(),
            high: self.bands[TaskPriority::High.band()].len(),
            normal: self.bands[TaskPriority::Normal.band()].len(),
            low: self.bands[TaskPriority::Low.band()].len(),
            total: self.len(),
        }
    }

    fn update_depth(&self) {
        self.depth.store(self.len(), Ordering::Relaxed);
    }
}
