//! Deferred-work queue.
//!
//! Compress-and-flush jobs are messages consumed by a small pool of worker
//! threads. The queue is unbounded; throughput is bounded upstream by the
//! writeback budget. `flush` waits until every queued and running job has
//! completed, and `destroy` drains the queue before joining the workers, so
//! unmount never abandons work.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct WqState<T> {
    jobs: VecDeque<T>,
    /// Jobs queued or currently running.
    pending: usize,
    shutdown: bool,
}

struct WqInner<T> {
    state: Mutex<WqState<T>>,
    work_cond: Condvar,
    idle_cond: Condvar,
}

/// A pool of worker threads consuming jobs of type `T`.
pub struct WorkQueue<T: Send + 'static> {
    inner: Arc<WqInner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn `nr_workers` threads running `handler` on each job.
    pub fn new<F>(name: &str, nr_workers: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let inner = Arc::new(WqInner {
            state: Mutex::new(WqState {
                jobs: VecDeque::new(),
                pending: 0,
                shutdown: false,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        });
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(nr_workers);
        for i in 0..nr_workers {
            let inner = inner.clone();
            let handler = handler.clone();
            let thread_name = format!("{name}/{i}");
            workers.push(
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || worker_loop(inner, handler))
                    .expect("spawn workqueue worker"),
            );
        }

        WorkQueue {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job. Once the queue is shutting down the job is handed
    /// back so the caller can unwind it.
    pub fn queue(&self, job: T) -> core::result::Result<(), T> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return Err(job);
        }
        state.jobs.push_back(job);
        state.pending += 1;
        self.inner.work_cond.notify_one();
        Ok(())
    }

    /// Block until all queued and in-flight jobs have completed.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.pending > 0 {
            state = self.inner.idle_cond.wait(state).unwrap();
        }
    }

    /// Drain remaining jobs and join the workers.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            self.inner.work_cond.notify_all();
        }
        let me = std::thread::current().id();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            // A worker can end up running the final teardown itself when it
            // held the last reference; it must not join its own thread.
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker_loop<T, F>(inner: Arc<WqInner<T>>, handler: Arc<F>)
where
    F: Fn(T) + Send + Sync,
{
    loop {
        let job = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = inner.work_cond.wait(state).unwrap();
            }
        };

        handler(job);

        let mut state = inner.state.lock().unwrap();
        state.pending -= 1;
        if state.pending == 0 {
            inner.idle_cond.notify_all();
        }
    }
}
