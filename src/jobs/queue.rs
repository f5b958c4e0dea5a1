//! In-process job queue
//!
//! FIFO of job IDs with blocking dequeue and a front-requeue used when a
//! transient segment failure sends a job back to the head of the line.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded-ish FIFO for the single-process deployment mode
pub struct LocalJobQueue {
    queue: Mutex<VecDeque<String>>,
    ready: Condvar,
}

impl LocalJobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn enqueue(&self, job_id: &str) {
        let mut queue = self.queue.lock().expect("queue lock");
        queue.push_back(job_id.to_string());
        self.ready.notify_one();
    }

    pub fn requeue_front(&self, job_id: &str) {
        let mut queue = self.queue.lock().expect("queue lock");
        queue.push_front(job_id.to_string());
        self.ready.notify_one();
    }

    /// Block up to `timeout` for the next job ID
    pub fn dequeue(&self, timeout: Duration) -> Option<String> {
        let mut queue = self.queue.lock().expect("queue lock");
        if let Some(job_id) = queue.pop_front() {
            return Some(job_id);
        }
        let (mut queue, _timed_out) = self
            .ready
            .wait_timeout(queue, timeout)
            .expect("queue lock");
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = LocalJobQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.dequeue(Duration::from_millis(10)), Some("a".into()));
        assert_eq!(queue.dequeue(Duration::from_millis(10)), Some("b".into()));
        assert_eq!(queue.dequeue(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_requeue_front_jumps_the_line() {
        let queue = LocalJobQueue::new();
        queue.enqueue("a");
        queue.requeue_front("urgent");
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)),
            Some("urgent".into())
        );
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(LocalJobQueue::new());
        let q2 = std::sync::Arc::clone(&queue);
        let handle = std::thread::spawn(move || q2.dequeue(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        queue.enqueue("late");
        assert_eq!(handle.join().unwrap(), Some("late".into()));
    }

    #[test]
    fn test_len() {
        let queue = LocalJobQueue::new();
        assert!(queue.is_empty());
        queue.enqueue("a");
        assert_eq!(queue.len(), 1);
    }
}
