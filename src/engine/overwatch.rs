//! Background reaper for stopped writer threads.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::core::{ComponentLogger, LogContext};

use super::registry::DeviceRegistry;

pub struct Overwatch {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

struct OverwatchLoop {
    registry: Arc<DeviceRegistry>,
    interval: Duration,
}

impl ComponentLogger for OverwatchLoop {
    fn log_context(&self) -> LogContext {
        LogContext::new("Overwatch", "engine")
    }
}

impl OverwatchLoop {
    fn run(self, shutdown: channel::Receiver<()>) {
        self.debug(&format!("reaping every {:?}", self.interval));
        loop {
            match shutdown.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let outcome = self.registry.reap_finished();
                    if outcome.reaped + outcome.panicked > 0 {
                        self.info(&format!(
                            "reaped {} writer(s), {} panicked",
                            outcome.reaped, outcome.panicked
                        ));
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.debug("stopped");
    }
}

impl Overwatch {
    pub fn spawn(registry: Arc<DeviceRegistry>, interval: Duration) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded(1);
        let worker = OverwatchLoop { registry, interval };
        let thread = std::thread::Builder::new()
            .name("overwatch".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Wakes the thread and waits for it. Returns `false` if it panicked.
    pub fn stop(&mut self) -> bool {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for Overwatch {
    fn drop(&mut self) {
        self.stop();
    }
}
