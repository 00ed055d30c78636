//! Fixed-size worker pool with cancellable delayed tasks
//!
//! Tasks run under a cooperative panic boundary: a failing task is logged
//! and never terminates its worker. Delayed tasks check their cancel flag
//! immediately before firing, so a cancelled timer never runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a pending delayed task.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
}

impl TimerHandle {
    /// Abort the pending fire. Atomic: after this returns, either the task
    /// already started or it will never run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wake;
        let mut woken = lock.lock();
        *woken = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Worker pool executing submitted tasks and delayed timers.
pub struct EventDispatcher {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Pool with `threads` workers; zero means the default of
    /// `max(2, host parallelism)`.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(2).max(2)
        } else {
            threads
        };

        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = Arc::clone(&receiver);
            workers.push(
                thread::Builder::new()
                    .name(format!("dispatcher-{i}"))
                    .spawn(move || worker_loop(receiver))
                    .expect("failed to spawn dispatcher worker"),
            );
        }

        tracing::debug!(threads, "Event dispatcher started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a task. Non-blocking; preserves submission order per producer.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(Box::new(task)).is_err() {
                    tracing::warn!("Dispatcher workers gone, task dropped");
                }
            }
            None => tracing::warn!("Dispatcher stopped, task dropped"),
        }
    }

    /// Fire `task` once after `delay`, unless cancelled first.
    pub fn submit_after(
        self: &Arc<Self>,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let handle = TimerHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(false), Condvar::new())),
        };
        let timer = handle.clone();
        let dispatcher = Arc::clone(self);
        // one short-lived thread per timer; parks until deadline or cancel
        let spawned = thread::Builder::new()
            .name("dispatcher-timer".to_string())
            .spawn(move || {
                {
                    let (lock, cvar) = &*timer.wake;
                    let mut woken = lock.lock();
                    if !*woken {
                        cvar.wait_for(&mut woken, delay);
                    }
                }
                if timer.is_cancelled() {
                    return;
                }
                dispatcher.submit(task);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn timer thread");
        }
        handle
    }

    /// Drain the queue and join the workers. No-op after the first call.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender); // closes the channel; workers exit after draining
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("Dispatcher worker panicked during shutdown");
            }
        }
        tracing::debug!("Event dispatcher stopped");
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = {
            let guard = receiver.lock();
            guard.recv()
        };
        match task {
            Ok(task) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                if result.is_err() {
                    tracing::error!("Dispatcher task panicked");
                }
            }
            // channel closed and drained
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_submit_runs_tasks() {
        let dispatcher = EventDispatcher::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            dispatcher.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        dispatcher.stop();
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let dispatcher = EventDispatcher::new(1);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            dispatcher.submit(move || tx.send(i).unwrap());
        }
        let received: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        dispatcher.stop();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let dispatcher = EventDispatcher::new(1);
        dispatcher.submit(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        dispatcher.stop();
    }

    #[test]
    fn test_delayed_task_fires() {
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let (tx, rx) = mpsc::channel();
        dispatcher.submit_after(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        dispatcher.stop();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = dispatcher.submit_after(Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        assert!(handle.is_cancelled());
        thread::sleep(Duration::from_millis(300));
        assert!(!fired.load(Ordering::SeqCst));
        dispatcher.stop();
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let dispatcher = EventDispatcher::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            dispatcher.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        // second stop is a no-op
        dispatcher.stop();
    }
}
