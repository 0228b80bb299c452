//! Periodic background work.
//!
//! The scheduler runs each registered task on its own thread, waking at the
//! task's interval until shutdown. Shutdown is cooperative: a shared flag is
//! flipped under a condvar, every sleeping task wakes immediately, and the
//! scheduler joins the threads. Tasks are never interrupted mid-execution.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::errlogic;
use crate::error::Result;

/// Trait for background tasks that run periodically
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    fn execute(&self) -> Result<()>;
}

/// Runs background tasks on dedicated threads with graceful shutdown
pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<ShutdownSignal>,
}

struct ShutdownSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    /// Sleeps up to `timeout`; returns true when shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(stopped, deadline - now)
                .unwrap();
            stopped = guard;
        }
        true
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(ShutdownSignal {
                stopped: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Register a periodic background task
    pub fn register(&self, task: Arc<dyn BackgroundTask>) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("emberstore-{}", task.name()))
            .spawn(move || {
                let mut run_id = 0u64;
                loop {
                    if shutdown.wait(task.interval()) {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                    run_id += 1;
                    if let Err(err) = task.execute() {
                        tracing::error!(
                            task = task.name(),
                            run_id,
                            error = %err,
                            "task execution failed"
                        );
                    }
                }
            })
            .map_err(|err| errlogic!("failed to spawn task thread: {err}"))?;
        self.handles.lock()?.push(handle);
        Ok(())
    }

    /// Graceful shutdown - signal all tasks and wait for them
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.stop();
        for handle in self.handles.lock()?.drain(..) {
            handle
                .join()
                .map_err(|_| errlogic!("task thread panicked"))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn execute(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_runs_tasks() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .register(Arc::new(TestTask {
                name: "test-task",
                interval: Duration::from_millis(10),
                counter: counter.clone(),
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_scheduler_graceful_shutdown() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .register(Arc::new(TestTask {
                name: "test-task",
                interval: Duration::from_millis(10),
                counter: counter.clone(),
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));

        // Shutdown interrupts the sleep instead of waiting out the interval.
        let start = Instant::now();
        scheduler.shutdown().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        let count_after_shutdown = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), count_after_shutdown);
    }

    #[test]
    fn test_failing_task_keeps_running() {
        struct FailingTask {
            counter: Arc<AtomicUsize>,
        }

        impl BackgroundTask for FailingTask {
            fn name(&self) -> &'static str {
                "failing-task"
            }

            fn interval(&self) -> Duration {
                Duration::from_millis(5)
            }

            fn execute(&self) -> Result<()> {
                self.counter.fetch_add(1, Ordering::SeqCst);
                Err(errlogic!("boom"))
            }
        }

        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(Arc::new(FailingTask {
                counter: counter.clone(),
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        // Errors are logged, not fatal: the task keeps firing.
        assert!(counter.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().unwrap();
    }
}
