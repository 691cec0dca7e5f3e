//! Dedicated role threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A named thread running one role loop.
///
/// The loop polls a shared `running` flag and returns once it is cleared.
/// The flag is cleared again when the loop returns on its own, so
/// `is_running` reflects fatal exits too.
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, running: Arc<AtomicBool>, body: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let name = name.into();
        running.store(true, Ordering::SeqCst);

        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                body(&flag);
                flag.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                running.store(false, Ordering::SeqCst);
                Error::Io(e)
            })?;

        debug!(thread = %name, "Worker started");
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Request termination and wait for the loop to exit. Safe to call
    /// more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(thread = %self.name, "Worker thread panicked");
            } else {
                debug!(thread = %self.name, "Worker stopped");
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
