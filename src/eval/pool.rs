//! Shared worker pool executing dispatched jobs.
//!
//! A fixed set of threads drains one job channel. A panicking job is
//! logged and dropped; the worker survives, matching the policy that an
//! uncaught handler exception kills the request, not the connection.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Sender, unbounded};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    job_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> WorkerPool {
        let (job_tx, job_rx) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|index| {
                let job_rx = job_rx.clone();
                thread::Builder::new()
                    .name(format!("confab-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                                tracing::error!(
                                    panic = panic_message(&panic),
                                    "worker job panicked; request dropped"
                                );
                            }
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool {
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job; it runs on whichever worker frees up first.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.job_tx.lock().expect("job sender lock poisoned");
        match guard.as_ref() {
            Some(job_tx) => {
                let _ = job_tx.send(Box::new(job));
            }
            None => tracing::warn!("job submitted after pool shutdown; dropped"),
        }
    }

    /// Stop accepting jobs and wait for the workers to drain.
    pub fn shutdown(&self) {
        self.job_tx.lock().expect("job sender lock poisoned").take();
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let current = thread::current().id();
        for handle in workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
