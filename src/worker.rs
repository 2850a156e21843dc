//! Plumbing shared by the dispatcher, consumer and collector threads.
//!
//! Each background loop runs on its own named thread, owns the receiving end
//! of a stop channel and hands its statistics back through the join handle.

use std::io;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

/// Receiving end of a worker's stop channel.
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    /// Whether stop was requested (or the owning handle is gone).
    pub fn is_stopped(&self) -> bool {
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Sleep for up to `timeout`, waking early on stop. Returns `true` when
    /// the worker should exit.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// A spawned loop returning `T` when it exits.
pub struct BackgroundWorker<T> {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Default + Send + 'static> BackgroundWorker<T> {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, rx) = channel();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(StopSignal { rx }))?;

        Ok(Self {
            name,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> T {
        let _ = self.stop_tx.send(());
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!(worker = %self.name, "worker thread panicked");
                T::default()
            }
            None => T::default(),
        }
    }
}

impl<T> Drop for BackgroundWorker<T> {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        // Don't join on drop - let the thread finish naturally
    }
}
