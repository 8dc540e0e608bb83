//! Pipeline health: published on a watch channel and mirrored to a JSON
//! status file read by `vigil status`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use vigil_core::SightingEvent;
use vigil_stream::StreamState;

/// Minimum interval between two status file writes.
const WRITE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub state: StreamState,
    /// Source description, credentials redacted.
    pub source: String,
    pub state_since: DateTime<Utc>,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub visits: u64,
    pub unknowns: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub known_persons: usize,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Health {
    pub fn new(source: String) -> Self {
        let now = Utc::now();
        Self {
            state: StreamState::Disconnected,
            source,
            state_since: now,
            frames_read: 0,
            frames_processed: 0,
            visits: 0,
            unknowns: 0,
            last_event_at: None,
            known_persons: 0,
            restarts: 0,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Write side of the health channel.
#[derive(Clone)]
pub struct HealthReporter {
    tx: watch::Sender<Health>,
}

impl HealthReporter {
    pub fn new(source: String) -> (Self, watch::Receiver<Health>) {
        let (tx, rx) = watch::channel(Health::new(source));
        (Self { tx }, rx)
    }

    pub fn current(&self) -> Health {
        self.tx.borrow().clone()
    }

    /// Record a stream state; logs and publishes only actual transitions.
    pub fn set_state(&self, state: StreamState) {
        self.tx.send_if_modified(|h| {
            if h.state == state {
                return false;
            }
            tracing::info!(
                from = %h.state,
                to = %state,
                source = %h.source,
                "stream state changed"
            );
            let now = Utc::now();
            h.state = state;
            h.state_since = now;
            h.updated_at = now;
            true
        });
    }

    pub fn frame(&self, processed: bool) {
        self.tx.send_modify(|h| {
            h.frames_read += 1;
            if processed {
                h.frames_processed += 1;
            }
            h.updated_at = Utc::now();
        });
    }

    pub fn event(&self, event: &SightingEvent) {
        self.tx.send_modify(|h| {
            match event {
                SightingEvent::Visit(_) => h.visits += 1,
                SightingEvent::Unknown(_) => h.unknowns += 1,
            }
            h.last_event_at = Some(event.timestamp());
            h.updated_at = Utc::now();
        });
    }

    pub fn registry_size(&self, persons: usize) {
        self.tx.send_if_modified(|h| {
            let changed = h.known_persons != persons;
            h.known_persons = persons;
            changed
        });
    }

    pub fn error(&self, error: &str) {
        self.tx.send_modify(|h| {
            h.last_error = Some(error.to_string());
            h.updated_at = Utc::now();
        });
    }

    pub fn restarted(&self) {
        self.tx.send_modify(|h| {
            h.restarts += 1;
            h.updated_at = Utc::now();
        });
    }
}

/// Atomically replace the status file with `health`.
pub fn write_status(path: &Path, health: &Health) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec_pretty(health).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Mirror every health change to `path`, at most once per second, until the
/// reporter is dropped. The final state is always written.
pub async fn run_status_writer(mut rx: watch::Receiver<Health>, path: PathBuf) {
    loop {
        let health = rx.borrow_and_update().clone();
        if let Err(e) = write_status(&path, &health) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write status file");
        }
        if rx.changed().await.is_err() {
            break;
        }
        tokio::time::sleep(WRITE_INTERVAL).await;
    }
}
