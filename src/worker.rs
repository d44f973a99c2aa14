//! Named background threads with a stop signal.
//!
//! Stopping drops the worker's end of a `crossbeam-channel`; the thread sees
//! the disconnect on its next `StopSignal::wait` and returns.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error};

use crate::error::Result;

/// Handed to a worker body; tells it when to return.
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    /// Sleep for up to `timeout`. Returns true once a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    pub fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// For use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

pub struct Worker {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str, body: impl FnOnce(StopSignal) + Send + 'static) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(StopSignal { rx }))?;
        debug!(worker = name, "started");
        Ok(Self {
            name: name.to_string(),
            stop: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the worker and wait for it to return.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => debug!(worker = %self.name, "stopped"),
                Err(_) => error!(worker = %self.name, "worker panicked"),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_stop_interrupts_wait() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let worker = Worker::spawn("test-worker", move |stop| {
            while !stop.wait(Duration::from_secs(60)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_stopped() {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let signal = StopSignal { rx };
        assert!(!signal.is_stopped());
        drop(tx);
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_panicking_worker_is_reported_not_propagated() {
        let worker = Worker::spawn("test-panic", |_| panic!("boom")).unwrap();
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
    }
}
