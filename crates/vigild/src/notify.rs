//! Notification dispatch.
//!
//! The pipeline hands notifications to [`NotifierHandle::notify`], which
//! only enqueues. A worker thread delivers each one to every configured
//! sink; sink failures are logged and retried once, never reported back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use vigil_core::SightingEvent;

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);
const SINK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hook: {0}")]
    Hook(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub image_path: Option<PathBuf>,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn from_event(event: &SightingEvent) -> Self {
        match event {
            SightingEvent::Visit(visit) => Self {
                title: format!("{} detected", visit.person_name),
                message: format!(
                    "{} arrived at entrance (confidence {:.1}%)",
                    visit.person_name,
                    visit.confidence * 100.0
                ),
                image_path: Some(visit.image_path.clone()),
                confidence: Some(visit.confidence),
                timestamp: visit.timestamp,
            },
            SightingEvent::Unknown(sighting) => Self {
                title: "Unknown person detected".into(),
                message: "Unknown visitor at entrance, please identify".into(),
                image_path: Some(sighting.image_path.clone()),
                confidence: None,
                timestamp: sighting.timestamp,
            },
        }
    }
}

pub trait NotificationSink: Send {
    fn name(&self) -> &str;
    fn notify(&mut self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&mut self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            title = %n.title,
            image = ?n.image_path,
            at = %n.timestamp.to_rfc3339(),
            "{}",
            n.message
        );
        Ok(())
    }
}

/// Keeps the newest `max_entries` notifications in a JSON file, newest
/// first, for dashboards to poll.
pub struct FeedSink {
    path: PathBuf,
    max_entries: usize,
    entries: Vec<Notification>,
}

impl FeedSink {
    /// Resume from an existing feed file if it parses; start empty otherwise.
    pub fn open(path: PathBuf, max_entries: usize) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<Notification>>(&bytes).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring unreadable notification feed"
                );
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            max_entries: max_entries.max(1),
            entries,
        }
    }

    fn persist(&self) -> Result<(), NotifyError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl NotificationSink for FeedSink {
    fn name(&self) -> &str {
        "feed"
    }

    fn notify(&mut self, n: &Notification) -> Result<(), NotifyError> {
        if self.entries.first() != Some(n) {
            self.entries.insert(0, n.clone());
            self.entries.truncate(self.max_entries);
        }
        self.persist()
    }
}

/// Runs a shell command per notification with the notification as JSON on
/// stdin. Used to bridge to mail, chat or push services.
///
/// The child runs on the daemon's tokio runtime; the notifier thread blocks
/// on it until it exits or the timeout kills it.
pub struct HookSink {
    command: String,
    timeout: Duration,
    runtime: Handle,
}

impl HookSink {
    pub fn new(command: impl Into<String>, runtime: Handle) -> Self {
        Self {
            command: command.into(),
            timeout: HOOK_TIMEOUT,
            runtime,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl NotificationSink for HookSink {
    fn name(&self) -> &str {
        "hook"
    }

    fn notify(&mut self, n: &Notification) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(n)?;
        self.runtime.block_on(run_hook(&self.command, n, &payload, self.timeout))
    }
}

async fn run_hook(
    command: &str,
    n: &Notification,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), NotifyError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("VIGIL_TITLE", &n.title)
        .env("VIGIL_MESSAGE", &n.message)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let waiting = feed_and_wait(&mut child, stdin, payload);
    let outcome = tokio::time::timeout(timeout, waiting).await;
    match outcome {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(NotifyError::Hook(format!("exited with {status}"))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill timed out hook");
            }
            Err(NotifyError::Hook(format!("timed out after {}ms", timeout.as_millis())))
        }
    }
}

async fn feed_and_wait(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    payload: &[u8],
) -> std::io::Result<ExitStatus> {
    if let Some(mut stdin) = stdin {
        // Hooks may exit without reading stdin.
        match stdin.write_all(payload).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
    }
    child.wait().await
}

/// Enqueue side of the notifier; cheap to clone.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: Option<mpsc::Sender<Notification>>,
}

impl NotifierHandle {
    /// A handle that drops everything, for when notifications are disabled.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueue without blocking. Returns false if the notification was dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(title = %n.title, "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("notifier stopped, dropping notification");
                false
            }
        }
    }
}

pub struct Notifier {
    handle: NotifierHandle,
    worker: JoinHandle<()>,
}

impl Notifier {
    pub fn spawn(sinks: Vec<Box<dyn NotificationSink>>, capacity: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let mut sinks = sinks;

        let worker = std::thread::Builder::new()
            .name("vigil-notifier".into())
            .spawn(move || {
                tracing::debug!(sinks = sinks.len(), "notifier started");
                while let Some(notification) = rx.blocking_recv() {
                    for sink in sinks.iter_mut() {
                        deliver(sink.as_mut(), &notification);
                    }
                }
                tracing::debug!("notifier exiting");
            })?;

        Ok(Self {
            handle: NotifierHandle { tx: Some(tx) },
            worker,
        })
    }

    pub fn handle(&self) -> NotifierHandle {
        self.handle.clone()
    }

    /// Deliver what is queued and stop. Waits for every handle to be dropped.
    pub fn shutdown(self) {
        let Self { handle, worker } = self;
        drop(handle);
        if worker.join().is_err() {
            tracing::error!("notifier thread panicked");
        }
    }
}

/// One attempt plus at most one retry; failures end here.
fn deliver(sink: &mut dyn NotificationSink, notification: &Notification) {
    let Err(first) = sink.notify(notification) else {
        return;
    };
    tracing::warn!(sink = sink.name(), error = %first, "notification failed, retrying once");
    std::thread::sleep(SINK_RETRY_DELAY);
    if let Err(e) = sink.notify(notification) {
        tracing::error!(
            sink = sink.name(),
            error = %e,
            title = %notification.title,
            "notification dropped"
        );
    }
}

/// Build the sinks selected by the `[notifications]` section. Hooks run on
/// `runtime`.
pub fn sinks_from_config(
    config: &vigil_core::config::NotificationConfig,
    feed_path: PathBuf,
    runtime: Handle,
) -> Vec<Box<dyn NotificationSink>> {
    let mut sinks: Vec<Box<dyn NotificationSink>> = Vec::new();
    if config.console {
        sinks.push(Box::new(LogSink));
    }
    if config.feed_enabled {
        sinks.push(Box::new(FeedSink::open(feed_path, config.feed_max_entries)));
    }
    if !config.hook_command.trim().is_empty() {
        sinks.push(Box::new(HookSink::new(config.hook_command.clone(), runtime)));
    }
    sinks
}
