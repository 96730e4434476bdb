//! Single-consumer background job queue.
//!
//! One worker thread drains a FIFO of closures. Zone recycling and metadata
//! persistence each get their own worker so a slow metadata flush never
//! delays a zone finish. Jobs still queued at shutdown run exactly once on
//! the dropping thread.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Worker parked, consuming nothing until resumed.
    Waiting,
    /// Worker consuming jobs.
    Running,
    /// Worker shut down; remaining jobs drain on the dropping thread.
    Terminated,
}

struct Queue {
    jobs: VecDeque<Job>,
    state: WorkerState,
}

struct Shared {
    queue: Mutex<Queue>,
    cv: Condvar,
}

/// A FIFO job queue drained by one dedicated thread.
pub struct BackgroundWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Spawns the worker thread in the running state.
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                state: WorkerState::Running,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::process_jobs(&thread_shared))
            .ok();
        if handle.is_none() {
            warn!(worker = name, "failed to spawn background worker thread");
        }

        Self { shared, handle }
    }

    fn process_jobs(shared: &Shared) {
        loop {
            let job = {
                let guard = match shared.queue.lock() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                let mut guard = match shared.cv.wait_while(guard, |q| {
                    (q.jobs.is_empty() || q.state == WorkerState::Waiting)
                        && q.state != WorkerState::Terminated
                }) {
                    Ok(g) => g,
                    Err(_) => return,
                };
                if guard.state == WorkerState::Terminated {
                    return;
                }
                match guard.jobs.pop_front() {
                    Some(job) => job,
                    None => continue,
                }
            };
            job();
        }
    }

    /// Enqueues a job. Jobs submitted after termination are drained by the
    /// destructor, preserving at-most-once execution.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut q) = self.shared.queue.lock() {
            q.jobs.push_back(Box::new(job));
            self.cv_notify();
        }
    }

    fn cv_notify(&self) {
        self.shared.cv.notify_one();
    }

    /// Parks the worker after the job it is currently running, keeping
    /// submissions queued.
    pub fn pause(&self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            if q.state == WorkerState::Running {
                q.state = WorkerState::Waiting;
            }
        }
    }

    /// Resumes a parked worker.
    pub fn resume(&self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            if q.state == WorkerState::Waiting {
                q.state = WorkerState::Running;
                self.shared.cv.notify_all();
            }
        }
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        self.shared
            .queue
            .lock()
            .map(|q| q.state)
            .unwrap_or(WorkerState::Terminated)
    }

    /// Blocks until every job submitted before this call has run.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel::<()>();
        self.submit(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            q.state = WorkerState::Terminated;
            self.shared.cv.notify_all();
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        // Drain whatever is left, including jobs submitted after
        // termination.
        let remaining = match self.shared.queue.lock() {
            Ok(mut q) => std::mem::take(&mut q.jobs),
            Err(_) => return,
        };
        for job in remaining {
            job();
        }
    }
}
