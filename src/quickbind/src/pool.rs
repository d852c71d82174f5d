//! Fixed-size worker pool for asynchronous native calls.
//!
//! Workers block on a condition variable, pull jobs from the pending FIFO
//! and push them to the completed FIFO. The host thread drains completions
//! during its service tick; `after_complete` therefore always runs on the
//! same thread as script execution, in enqueue order within one drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rquickjs::Ctx;
use tracing::debug;

/// One unit of asynchronous work. `run` executes on a worker thread and must
/// not touch script state; `after_complete` runs on the host thread.
pub trait Job: Send {
    fn run(&mut self);
    fn after_complete(self: Box<Self>, ctx: &Ctx<'_>);
}

struct Shared {
    pending: Mutex<VecDeque<Box<dyn Job>>>,
    completed: Mutex<VecDeque<Box<dyn Job>>>,
    work_cv: Condvar,
    stop: AtomicBool,
}

/// Cloneable submission handle, usable from anywhere on the host thread.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    pub fn submit(&self, job: Box<dyn Job>) {
        self.shared.pending.lock().expect("pending queue poisoned").push_back(job);
        self.shared.work_cv.notify_all();
    }

    pub fn submit_all(&self, jobs: impl IntoIterator<Item = Box<dyn Job>>) {
        let mut pending = self.shared.pending.lock().expect("pending queue poisoned");
        pending.extend(jobs);
        drop(pending);
        self.shared.work_cv.notify_all();
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `count` workers; zero means one per hardware thread.
    pub fn start(count: usize) -> Self {
        let count = if count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            count
        };

        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let workers = (0..count)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("quickbind-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!(count, "worker pool started");
        Self { shared, workers }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle { shared: self.shared.clone() }
    }

    /// Runs every completed job's `after_complete`, in enqueue order.
    /// Returns `true` if any job completed or work is still pending.
    pub fn drain(&self, ctx: &Ctx<'_>) -> bool {
        let mut batch = VecDeque::new();
        {
            let mut completed = self.shared.completed.lock().expect("completed queue poisoned");
            std::mem::swap(&mut *completed, &mut batch);
        }
        let had_work = !batch.is_empty();
        for job in batch {
            job.after_complete(ctx);
        }
        had_work || !self.shared.pending.lock().expect("pending queue poisoned").is_empty()
    }

    /// `true` while jobs are pending or awaiting their completion drain.
    pub fn is_busy(&self) -> bool {
        !self.shared.pending.lock().expect("pending queue poisoned").is_empty()
            || !self.shared.completed.lock().expect("completed queue poisoned").is_empty()
    }

    /// Stops every worker and joins them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.work_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut pending = shared.pending.lock().expect("pending queue poisoned");
            loop {
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = pending.pop_front() {
                    break job;
                }
                pending = shared.work_cv.wait(pending).expect("pending queue poisoned");
            }
        };

        let mut job = job;
        job.run();
        shared.completed.lock().expect("completed queue poisoned").push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountJob {
        id: usize,
        ran: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
    }

    impl Job for CountJob {
        fn run(&mut self) {
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        fn after_complete(self: Box<Self>, _ctx: &Ctx<'_>) {
            self.order.lock().unwrap().push(self.id);
        }
    }

    #[test]
    fn completions_drain_in_enqueue_order() {
        let rt = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&rt).unwrap();

        // One worker serialises execution, so completion order matches
        // submission order within the drain.
        let mut pool = WorkerPool::start(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let handle = pool.handle();
        for id in 0..8 {
            handle.submit(Box::new(CountJob {
                id,
                ran: ran.clone(),
                order: order.clone(),
            }));
        }

        while ran.load(Ordering::SeqCst) < 8 {
            thread::yield_now();
        }
        // Let the worker push the last completion.
        thread::sleep(std::time::Duration::from_millis(20));

        context.with(|ctx| {
            assert!(pool.drain(&ctx));
        });
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());

        pool.shutdown();
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let mut pool = WorkerPool::start(4);
        pool.shutdown();
        assert!(!pool.is_busy());
    }
}
