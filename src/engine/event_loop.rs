//! Host event queue.
//!
//! Every engine completion is posted here and runs on a later turn, never
//! inside the call that issued the request. The host drives the queue with
//! [`EventLoop::run_until_idle`] (or one turn at a time).

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A unit of deferred work.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of pending tasks.
pub(crate) struct EventLoop {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl EventLoop {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Queue a task for a later turn.
    pub(crate) fn post(&self, task: Task) {
        // The receiver lives as long as the loop, so the send cannot fail.
        let _ = self.sender.send(task);
    }

    /// Run one queued task. Returns false when the queue was empty.
    pub(crate) fn run_once(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }

    /// Run tasks, including ones queued by earlier tasks, until none remain.
    pub(crate) fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        while self.run_once() {
            turns += 1;
        }
        turns
    }

    pub(crate) fn pending(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_post_order() {
        let events = Arc::new(EventLoop::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            events.post(Box::new(move || seen.lock().push(i)));
        }

        assert_eq!(events.pending(), 3);
        assert_eq!(events.run_until_idle(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_nested_posts_run_on_later_turns() {
        let events = Arc::new(EventLoop::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_events = Arc::clone(&events);
        let inner_seen = Arc::clone(&seen);
        events.post(Box::new(move || {
            let nested_seen = Arc::clone(&inner_seen);
            inner_events.post(Box::new(move || nested_seen.lock().push("nested")));
            inner_seen.lock().push("outer");
        }));

        assert!(events.run_once());
        assert_eq!(*seen.lock(), vec!["outer"]);
        assert_eq!(events.run_until_idle(), 1);
        assert_eq!(*seen.lock(), vec!["outer", "nested"]);
        assert!(!events.run_once());
    }
}
