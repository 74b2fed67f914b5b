//! Single-threaded step executor.
//!
//! One worker thread owns the engine state; every cache mutation runs as
//! a closure ("step") on that thread. Public entry points marshal steps in
//! with [`FiberLoop::run`] and block on a completion channel; background
//! paths use [`FiberLoop::post`]. Shutdown posts a sentinel, after which
//! further submissions fail with `Cancelled`.

use crate::error::{ClientError, Result};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Job<S> {
    Step(Box<dyn FnOnce(&mut S) + Send>),
    Shutdown,
}

pub struct FiberLoop<S: Send + 'static> {
    tx: mpsc::Sender<Job<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> FiberLoop<S> {
    pub fn new(name: &str, mut state: S) -> Self {
        let (tx, rx) = mpsc::channel::<Job<S>>();
        let thread_name = name.to_string();
        let worker = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::debug!("Fiber loop {} started", thread_name);
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Step(step) => step(&mut state),
                        Job::Shutdown => break,
                    }
                }
                tracing::debug!("Fiber loop {} stopped", thread_name);
            })
            .unwrap_or_else(|e| panic!("failed to spawn fiber thread: {e}"));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Runs one step on the fiber thread and blocks until it completes.
    pub fn run<R, F>(&self, step: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let job = Job::Step(Box::new(move |state: &mut S| {
            let _ = done_tx.send(step(state));
        }));
        self.tx.send(job).map_err(|_| ClientError::Cancelled)?;
        done_rx.recv().map_err(|_| ClientError::Cancelled)
    }

    /// Queues a step without waiting for it.
    pub fn post<F>(&self, step: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.tx.send(Job::Step(Box::new(step))).is_err() {
            tracing::debug!("Dropping step posted after fiber shutdown");
        }
    }

    /// Stops the worker after draining already queued steps.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = worker.join();
        }
    }
}

impl<S: Send + 'static> Drop for FiberLoop<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodically posts a step onto a fiber loop until stopped or dropped.
pub struct PeriodicTimer {
    stop_tx: mpsc::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn spawn<S, F>(name: &str, interval: Duration, fiber: Arc<FiberLoop<S>>, tick: F) -> Self
    where
        S: Send + 'static,
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let tick = Arc::new(tick);
        let thread_name = name.to_string();
        let worker = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let tick = Arc::clone(&tick);
                        fiber.post(move |state| (*tick)(state));
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn timer thread: {e}"));
        Self {
            stop_tx,
            worker: Some(worker),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
