//! Worker pools: one OS thread per job, cooperative shutdown, and a short
//! spin-then-sleep backoff when a job reports no work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of work scheduled onto a pool thread.
pub trait Job: Send {
    /// One pass; returns whether any work was done.
    fn run(&mut self, worker_id: usize) -> bool;

    /// Called on the worker thread after the shutdown flag is observed.
    fn on_close(&mut self) {}
}

pub struct WorkerPool {
    name: String,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn one named thread per job.
    pub fn start(name: &str, jobs: Vec<Box<dyn Job>>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = jobs
            .into_iter()
            .enumerate()
            .map(|(worker_id, mut job)| {
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("{name}-{worker_id}"))
                    .spawn(move || {
                        let mut idle_loops = 0u32;
                        while !shutdown.load(Ordering::Acquire) {
                            if job.run(worker_id) {
                                idle_loops = 0;
                                continue;
                            }
                            idle_loops += 1;
                            if idle_loops < 64 {
                                std::hint::spin_loop();
                            } else if idle_loops < 128 {
                                std::thread::yield_now();
                            } else {
                                std::thread::sleep(Duration::from_millis(1));
                            }
                        }
                        job.on_close();
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            name: name.to_string(),
            shutdown,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal shutdown and join every worker. Jobs get their `on_close`
    /// pass on their own thread before it exits.
    pub fn halt(mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountJob {
        counter: Arc<AtomicU64>,
        closed: Arc<AtomicBool>,
    }

    impl Job for CountJob {
        fn run(&mut self, _worker_id: usize) -> bool {
            self.counter.fetch_add(1, Ordering::Relaxed);
            true
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn runs_jobs_and_closes_them_on_halt() {
        let counter = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::start(
            "test",
            vec![Box::new(CountJob {
                counter: Arc::clone(&counter),
                closed: Arc::clone(&closed),
            })],
        );
        while counter.load(Ordering::Relaxed) < 100 {
            std::thread::yield_now();
        }
        pool.halt();
        assert!(closed.load(Ordering::Acquire));
    }
}
