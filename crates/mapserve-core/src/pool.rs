//! Fixed-size worker pool fed by a bounded FIFO queue.
//!
//! `submit` never blocks: a full (or stopping) queue hands the job straight
//! back so the caller can apply back-pressure. Workers sleep on a condition
//! variable while the queue is empty.

use crate::error::{ServerError, ServerResult};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

struct Queue<T> {
    jobs: VecDeque<T>,
    stopping: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `threads` workers that run `handler` on every submitted job.
    ///
    /// With `pin` set, worker `i` is pinned to core `i % cores`. Fails if the
    /// shape is empty or a thread cannot be spawned; workers already started
    /// are stopped and joined before returning the error.
    pub fn new<F>(threads: usize, max_requests: usize, pin: bool, handler: F) -> ServerResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(ServerError::Pool("worker thread count must be positive".into()));
        }
        if max_requests == 0 {
            return Err(ServerError::Pool("request queue depth must be positive".into()));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(max_requests.min(4096)),
                stopping: false,
            }),
            available: Condvar::new(),
            capacity: max_requests,
        });
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let name = format!("mapserve-worker-{i}");
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = Arc::clone(&pool.shared);
            let handler = Arc::clone(&handler);

            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                if let Some(id) = core_id {
                    if core_affinity::set_for_current(id) {
                        tracing::debug!(worker = i, core = id.id, "worker pinned");
                    } else {
                        tracing::warn!(worker = i, core = id.id, "failed to pin worker");
                    }
                }
                work(i, &shared, handler.as_ref());
            });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    pool.shutdown();
                    return Err(ServerError::Spawn { name, source });
                }
            }
        }

        tracing::info!(threads, max_requests, pin, "worker pool started");
        Ok(pool)
    }

    /// Queue a job, or get it back if the queue is full or shutting down.
    pub fn submit(&self, job: T) -> Result<(), T> {
        let mut queue = self.shared.lock();
        if queue.stopping || queue.jobs.len() >= self.shared.capacity {
            return Err(job);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Stop intake, let running jobs finish and join every worker.
    /// Returns how many queued jobs were discarded.
    pub fn shutdown(&mut self) -> usize {
        let dropped = {
            let mut queue = self.shared.lock();
            queue.stopping = true;
            let dropped = queue.jobs.len();
            queue.jobs.clear();
            dropped
        };
        self.shared.available.notify_all();

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "worker exited by panic");
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "discarded queued jobs at shutdown");
        }
        dropped
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

fn work<T, F: Fn(T)>(id: usize, shared: &Shared<T>, handler: &F) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if queue.stopping {
                    tracing::trace!(worker = id, "worker exiting");
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        // A panicking job must not take the worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
            tracing::error!(worker = id, "job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_submitted_job() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let mut pool = WorkerPool::new(4, 128, false, move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..100 {
            pool.submit(1).unwrap();
        }
        while pool.queued() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn full_queue_hands_the_job_back() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started = Mutex::new(started_tx);

        let mut pool = WorkerPool::new(1, 2, false, move |_: u32| {
            let _ = started.lock().unwrap().send(());
            let _ = gate.lock().unwrap().recv();
        })
        .unwrap();

        // The single worker picks this up and blocks on the gate.
        pool.submit(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(1).unwrap();
        pool.submit(2).unwrap();
        assert_eq!(pool.submit(3), Err(3));

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        drop(gate_tx);
        pool.shutdown();
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(1, 8, false, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            tx.lock().unwrap().send(n).unwrap();
        })
        .unwrap();

        pool.submit(0).unwrap();
        pool.submit(7).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let mut pool = WorkerPool::new(2, 8, false, |_: u8| {}).unwrap();
        pool.shutdown();
        assert_eq!(pool.submit(9), Err(9));
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn empty_shapes_are_errors() {
        assert!(matches!(
            WorkerPool::new(0, 8, false, |_: u8| {}),
            Err(ServerError::Pool(_))
        ));
        assert!(matches!(
            WorkerPool::new(2, 0, false, |_: u8| {}),
            Err(ServerError::Pool(_))
        ));
    }
}
