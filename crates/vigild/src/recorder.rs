//! Persistence worker.
//!
//! Emitted events are appended to the store from a dedicated thread so a
//! slow or locked database never stalls recognition. Writes are retried a
//! few times with a linear backoff, then logged and dropped.

use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use vigil_core::{SightingEvent, UnknownSighting, Visit};
use vigil_store::{Store, StoreError};

/// Append-only sink for emitted events.
pub trait EventStore: Send + 'static {
    fn record_visit(&mut self, visit: &Visit) -> Result<i64, StoreError>;
    fn record_unknown(&mut self, sighting: &UnknownSighting) -> Result<i64, StoreError>;
}

impl EventStore for Store {
    fn record_visit(&mut self, visit: &Visit) -> Result<i64, StoreError> {
        Store::record_visit(self, visit)
    }

    fn record_unknown(&mut self, sighting: &UnknownSighting) -> Result<i64, StoreError> {
        Store::record_unknown(self, sighting.timestamp, &sighting.image_path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Wait before retry n is `n * step`.
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            step: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<SightingEvent>,
}

impl RecorderHandle {
    pub fn submit(&self, event: SightingEvent) {
        if self.tx.send(event).is_err() {
            tracing::error!("recorder stopped, event not persisted");
        }
    }
}

pub struct Recorder {
    handle: RecorderHandle,
    worker: JoinHandle<()>,
}

impl Recorder {
    pub fn spawn<S: EventStore>(store: S, retry: RetryPolicy) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SightingEvent>();
        let mut store = store;

        let worker = std::thread::Builder::new()
            .name("vigil-recorder".into())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    persist(&mut store, &event, retry);
                }
                tracing::debug!("recorder drained, exiting");
            })?;

        Ok(Self {
            handle: RecorderHandle { tx },
            worker,
        })
    }

    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    /// Write everything still queued and stop. Waits for every handle to be dropped.
    pub fn shutdown(self) {
        let Self { handle, worker } = self;
        drop(handle);
        if worker.join().is_err() {
            tracing::error!("recorder thread panicked");
        }
    }
}

fn persist<S: EventStore>(store: &mut S, event: &SightingEvent, retry: RetryPolicy) {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        let result = match event {
            SightingEvent::Visit(visit) => store.record_visit(visit),
            SightingEvent::Unknown(sighting) => store.record_unknown(sighting),
        };
        match result {
            Ok(id) => {
                tracing::debug!(id, at = %event.timestamp().to_rfc3339(), "event persisted");
                return;
            }
            // Retrying cannot bring a deleted person back.
            Err(e @ StoreError::PersonNotFound(_)) => {
                tracing::warn!(error = %e, "dropping visit of removed person");
                return;
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, error = %e, "persisting event failed, retrying");
                std::thread::sleep(retry.step * attempt);
            }
            Err(e) => {
                tracing::error!(
                    attempts,
                    error = %e,
                    image = %event.image_path().display(),
                    "persisting event failed, dropping"
                );
            }
        }
    }
}
