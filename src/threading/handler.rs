//! Fixed sets of named worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::{CommoError, Result};

/// Cooperative stop signal handed to each worker thread.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create a flag in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the owning handler asked the thread to exit.
    pub fn should_stop(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Ask the thread to exit.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Body of the threads owned by a [`ThreadedHandler`].
pub trait ThreadWorker: Send + Sync + 'static {
    /// Run thread `index` until `stop` is set.
    fn thread_entry(&self, index: usize, stop: &StopFlag);

    /// Wake thread `index` out of any blocking wait after its stop flag
    /// was set.
    fn thread_stop_signal(&self, index: usize);
}

struct WorkerThread {
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

/// Owns one named OS thread per configured name.
///
/// Threads are started once and stopped once; [`ThreadedHandler::stop`] is
/// idempotent and is normally invoked from the owning manager's `Drop`.
pub struct ThreadedHandler {
    names: &'static [&'static str],
    threads: Mutex<Vec<WorkerThread>>,
}

impl ThreadedHandler {
    /// Create a handler for the given thread names.
    pub fn new(names: &'static [&'static str]) -> Self {
        Self {
            names,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Number of threads this handler runs.
    pub fn thread_count(&self) -> usize {
        self.names.len()
    }

    /// Spawn every thread, each calling `worker.thread_entry(index, ..)`.
    pub fn start<W: ThreadWorker>(&self, worker: Arc<W>) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(CommoError::invalid("threads already started"));
        }
        for (index, name) in self.names.iter().enumerate() {
            let stop = StopFlag::new();
            let thread_stop = stop.clone();
            let thread_worker = Arc::clone(&worker);
            let spawned = thread::Builder::new()
                .name((*name).to_string())
                .spawn(move || thread_worker.thread_entry(index, &thread_stop));
            match spawned {
                Ok(handle) => threads.push(WorkerThread {
                    stop,
                    handle: Some(handle),
                }),
                Err(e) => {
                    drop(threads);
                    self.stop(worker.as_ref());
                    return Err(CommoError::Io(e));
                }
            }
            debug!(thread = name, "started worker thread");
        }
        Ok(())
    }

    /// Signal every thread to stop, wake it, and join it.
    pub fn stop<W: ThreadWorker + ?Sized>(&self, worker: &W) {
        let mut threads = std::mem::take(&mut *self.threads.lock());
        for (index, t) in threads.iter().enumerate() {
            t.stop.stop();
            worker.thread_stop_signal(index);
        }
        let current = thread::current().id();
        for (index, t) in threads.iter_mut().enumerate() {
            let Some(handle) = t.handle.take() else {
                continue;
            };
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(thread = self.names.get(index).copied(), "worker thread panicked");
            }
        }
    }
}
