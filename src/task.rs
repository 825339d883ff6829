//! Thread ownership for the relay engines.
//!
//! Every relay thread is spawned through a [`TaskSet`], polls the shared
//! [`Shutdown`] token between blocking calls, and reports unrecoverable
//! conditions on the fatal channel instead of exiting the process itself.

use crate::error::ProxyError;
use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sending half of the fatal channel, handed to relay threads.
#[derive(Clone, Debug)]
pub struct FatalReporter {
    tx: Sender<ProxyError>,
}

impl FatalReporter {
    pub fn report(&self, error: ProxyError) {
        logger::error(format!("fatal: {error}"));
        // The receiver only disappears once the proxy is being torn down.
        let _ = self.tx.send(error);
    }
}

pub struct TaskSet {
    shutdown: Shutdown,
    handles: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: Sender<ProxyError>,
    fatal_rx: Receiver<ProxyError>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        let (fatal_tx, fatal_rx) = crossbeam_channel::unbounded();
        Self {
            shutdown: Shutdown::new(),
            handles: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx,
        }
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn fatal_reporter(&self) -> FatalReporter {
        FatalReporter {
            tx: self.fatal_tx.clone(),
        }
    }

    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.into()).spawn(body)?;
        let mut handles = self.handles.lock();
        reap_finished(&mut handles);
        handles.push(handle);
        Ok(())
    }

    /// Number of threads still running. Finished ones are joined first.
    pub fn len(&self) -> usize {
        let mut handles = self.handles.lock();
        reap_finished(&mut handles);
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until a relay thread reports a fatal error.
    pub fn wait_fatal(&self) -> Option<ProxyError> {
        self.fatal_rx.recv().ok()
    }

    pub fn wait_fatal_timeout(&self, timeout: Duration) -> Option<ProxyError> {
        match self.fatal_rx.recv_timeout(timeout) {
            Ok(error) => Some(error),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Signals every thread to stop and waits for all of them. Threads
    /// spawned while joining (TCP pumps) are joined as well.
    pub fn shutdown_and_join(&self) {
        self.shutdown.trigger();
        loop {
            let drained: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
            if drained.is_empty() {
                break;
            }
            drained.into_iter().for_each(join_logged);
        }
        logger::breadcrumb(BreadcrumbFlags::BOOT, "all relay threads joined");
    }
}

/// Joins handles whose thread already returned. Every closed TCP client
/// leaves two finished pumps behind.
fn reap_finished(handles: &mut Vec<JoinHandle<()>>) {
    let mut idx = 0;
    while idx < handles.len() {
        if handles[idx].is_finished() {
            join_logged(handles.swap_remove(idx));
        } else {
            idx += 1;
        }
    }
}

fn join_logged(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("relay").to_string();
    if handle.join().is_err() {
        logger::warn(format!("thread {name} panicked"));
    }
}
