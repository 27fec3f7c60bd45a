//! Fixed-size pool of worker threads.
//!
//! Jobs are handed over on a zero-capacity channel: `execute` blocks until a
//! worker is free to take the job, so nothing queues inside the process.

use crate::error::{ProxyError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(0);

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("relay-worker-{}", id))
                .spawn(move || worker_loop(id, receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Hands `job` to the next idle worker, waiting for one if all are busy.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // clone so the lock is not held while waiting for a worker
        let sender = lock(&self.sender).clone().ok_or(ProxyError::PoolShutdown)?;
        sender.send(Box::new(job)).map_err(|_| ProxyError::PoolShutdown)
    }

    /// Stops accepting jobs. Workers finish what they are running and exit.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Waits for all workers to exit. Only returns after `shutdown`.
    pub fn join(&self) {
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("Worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, receiver: Receiver<Job>) {
    log::debug!("Worker {} started", id);
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Worker {} recovered from a panicking job", id);
        }
    }
    log::debug!("Worker {} stopped", id);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
