//! Executor abstraction for asynchronous observer notification
//!
//! By default observers are notified inline, on the thread that produced the
//! event. Installing an executor moves each observer invocation onto the
//! executor's thread(s); within one notification call the tasks are submitted
//! in observer order.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::trace;

/// A one-shot task dispatcher used to decouple observer execution from event
/// production.
pub trait EventNotificationExecutor: Send + Sync {
    /// Submit a task. Tasks submitted from the same thread must execute in
    /// submission order.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Executor backed by a single worker thread fed through an unbounded
/// channel.
///
/// Dropping the executor lets already submitted tasks finish, then joins the
/// worker.
pub struct SingleThreadExecutor {
    sender: Option<Sender<Box<dyn FnOnce() + Send>>>,
    worker: Option<JoinHandle<()>>,
}

impl SingleThreadExecutor {
    /// Spawn the worker thread.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Box<dyn FnOnce() + Send>>();
        let worker = thread::spawn(move || {
            for task in receiver {
                task();
            }
            trace!("event notification worker drained");
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }
}

impl Default for SingleThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotificationExecutor for SingleThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if let Some(sender) = &self.sender {
            // The worker only terminates when the sender is dropped, so the
            // send can only fail during teardown.
            let _ = sender.send(task);
        }
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = SingleThreadExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            executor.execute(Box::new(move || log.lock().unwrap().push(i)));
        }

        // Dropping joins the worker after the queue drains.
        drop(executor);
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn drop_waits_for_in_flight_tasks() {
        let executor = SingleThreadExecutor::new();
        let done = Arc::new(Mutex::new(false));
        {
            let done = Arc::clone(&done);
            executor.execute(Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                *done.lock().unwrap() = true;
            }));
        }
        drop(executor);
        assert!(*done.lock().unwrap());
    }
}
