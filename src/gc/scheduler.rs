//! Background collection worker
//!
//! One OS thread per collector, parked on a flume channel. The timer is the
//! channel's receive timeout; dropping the sender is the shutdown signal.

use super::Shared;
use crate::config::GcMode;
use crate::error::{GcError, Result};
use crate::logging::{debug, error, trace};
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Messages the collector sends its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Run a collection now, regardless of mode
    Collect,
    /// Mode or interval changed; restart the wait with the new values
    Reconfigure,
}

/// Handle to the running worker thread
pub(crate) struct Worker {
    sender: Sender<Signal>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        // Pending requests coalesce; one queued collection is as good as many
        let (sender, receiver) = flume::bounded(4);
        let handle = thread::Builder::new()
            .name("nlib-gc".into())
            .spawn(move || run(shared, receiver))
            .map_err(GcError::WorkerSpawn)?;
        Ok(Self { sender, handle })
    }

    pub(crate) fn notify(&self, signal: Signal) {
        match self.sender.try_send(signal) {
            Ok(()) => trace!(?signal, "Signalled background collector"),
            Err(TrySendError::Full(_)) => trace!(?signal, "Background collector already has pending work"),
            Err(TrySendError::Disconnected(_)) => debug!(?signal, "Background collector is not running"),
        }
    }

    /// Close the channel and wait for the thread to exit
    pub(crate) fn stop(self) {
        let Self { sender, handle } = self;
        drop(sender);
        if handle.join().is_err() {
            error!("Background collector thread panicked");
        }
    }
}

fn run(shared: Arc<Shared>, receiver: Receiver<Signal>) {
    debug!("Background collector started");

    loop {
        let signal = match shared.mode() {
            GcMode::Manual => match receiver.recv() {
                Ok(signal) => Some(signal),
                Err(_) => break,
            },
            GcMode::Automatic | GcMode::Adaptive => match receiver.recv_timeout(shared.collection_interval()) {
                Ok(signal) => Some(signal),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        if shared.is_shutdown() {
            break;
        }

        match signal {
            Some(Signal::Collect) => {
                shared.collect(false);
            }
            Some(Signal::Reconfigure) => {}
            None => {
                if shared.should_trigger_collection() {
                    shared.collect(false);
                }
            }
        }
    }

    debug!("Background collector stopped");
}
