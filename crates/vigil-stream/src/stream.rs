//! Reconnecting stream source.
//!
//! A finite state machine around a [`Connector`]: frames are pulled from the
//! current connection; any failure drops the connection and retries with
//! bounded exponential backoff until a new connection delivers a frame or
//! the attempt budget is spent.

use crate::frame::Frame;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Granularity at which a cancellable wait checks its stop signal.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("stream gave up after {attempts} consecutive failures (last: {last})")]
    Exhausted { attempts: u32, last: String },
    #[error("stream is in the failed state")]
    Failed,
}

impl StreamError {
    /// True for errors the pipeline cannot recover from by itself.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Failed)
    }
}

/// Connection state, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An open connection yielding frames.
pub trait FrameSource: Send {
    /// Block until the next frame. `Ok(None)` means the source ran out of data.
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError>;

    /// Release the connection. Called at most once; dropping must also release it.
    fn close(&mut self) {}
}

/// Opens connections to one video source.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, StreamError>;

    /// Human-readable source name for logs, without credentials.
    fn describe(&self) -> String;
}

/// Waits between reconnect attempts.
pub trait Sleeper: Send {
    /// Sleep for `duration`. Returns false if the wait was cancelled.
    fn sleep(&mut self, duration: Duration) -> bool;
}

/// Plain thread sleep, never cancelled.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        true
    }
}

/// Sleeps in short slices, giving up as soon as the stop signal is raised.
pub struct WatchSleeper {
    stop: watch::Receiver<bool>,
}

impl WatchSleeper {
    pub fn new(stop: watch::Receiver<bool>) -> Self {
        Self { stop }
    }
}

impl Sleeper for WatchSleeper {
    fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if *self.stop.borrow() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Reconnect budget and backoff curve.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before the stream is declared failed.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the retry that follows the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Called on every state transition.
pub type StateObserver = Box<dyn FnMut(StreamState) + Send>;

pub struct StreamSource {
    connector: Box<dyn Connector>,
    observer: Option<StateObserver>,
    sleeper: Box<dyn Sleeper>,
    policy: ReconnectPolicy,
    state: StreamState,
    current: Option<Box<dyn FrameSource>>,
    /// Failures since the last frame was delivered.
    failures: u32,
    /// A frame read while establishing the connection, not yet handed out.
    pending: Option<Frame>,
}

impl StreamSource {
    /// Connect to the source, retrying per `policy`.
    ///
    /// Returns `Ok` with the source Disconnected if cancelled while waiting;
    /// the next `read_frame` then returns `Ok(None)`.
    pub fn open(
        connector: Box<dyn Connector>,
        policy: ReconnectPolicy,
        sleeper: Box<dyn Sleeper>,
    ) -> Result<Self, StreamError> {
        Self::open_observed(connector, policy, sleeper, None)
    }

    /// Like [`StreamSource::open`], reporting every state transition to `observer`.
    pub fn open_observed(
        connector: Box<dyn Connector>,
        policy: ReconnectPolicy,
        sleeper: Box<dyn Sleeper>,
        observer: Option<StateObserver>,
    ) -> Result<Self, StreamError> {
        let mut stream = Self {
            connector,
            observer,
            sleeper,
            policy,
            state: StreamState::Disconnected,
            current: None,
            failures: 0,
            pending: None,
        };
        tracing::info!(source = %stream.connector.describe(), "opening stream");
        if let Some(frame) = stream.establish()? {
            stream.pending = Some(frame);
        }
        Ok(stream)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Consecutive failures since the last delivered frame.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Next frame, reconnecting transparently.
    ///
    /// `Ok(None)` means end of stream: the source was closed or a backoff
    /// wait was cancelled. A fatal `StreamError::Exhausted` is returned
    /// exactly once; the state is then Failed.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }

        match self.state {
            StreamState::Failed => return Err(StreamError::Failed),
            StreamState::Streaming => {}
            _ => return Ok(None),
        }

        let reason = match self.read_current() {
            Ok(frame) => return Ok(Some(frame)),
            Err(reason) => reason,
        };

        tracing::warn!(
            source = %self.connector.describe(),
            %reason,
            "stream read failed, reconnecting"
        );
        self.drop_connection();
        self.record_failure(reason)?;
        self.set_state(StreamState::Reconnecting);
        self.establish()
    }

    /// Release the connection; later reads return `Ok(None)`.
    pub fn close(&mut self) {
        self.drop_connection();
        self.pending = None;
        if self.state != StreamState::Failed {
            self.set_state(StreamState::Disconnected);
        }
        tracing::info!(source = %self.connector.describe(), "stream closed");
    }

    fn read_current(&mut self) -> Result<Frame, String> {
        let Some(source) = self.current.as_mut() else {
            return Err("no connection".into());
        };
        match source.read_frame() {
            Ok(Some(frame)) => {
                self.failures = 0;
                Ok(frame)
            }
            Ok(None) => Err("end of stream".into()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Connect (after a backoff if this is a retry) until a connection
    /// delivers its first frame.
    fn establish(&mut self) -> Result<Option<Frame>, StreamError> {
        loop {
            if self.failures > 0 {
                let wait = self.policy.backoff(self.failures);
                tracing::info!(
                    attempt = self.failures,
                    max = self.policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "waiting before reconnect"
                );
                if !self.sleeper.sleep(wait) {
                    tracing::info!("reconnect wait cancelled");
                    self.set_state(StreamState::Disconnected);
                    return Ok(None);
                }
            }

            if self.state != StreamState::Reconnecting {
                self.set_state(StreamState::Connecting);
            }

            let reason = match self.connector.connect() {
                Ok(source) => {
                    self.current = Some(source);
                    match self.read_current() {
                        Ok(frame) => {
                            self.set_state(StreamState::Streaming);
                            tracing::info!(
                                source = %self.connector.describe(),
                                width = frame.width,
                                height = frame.height,
                                "stream connected"
                            );
                            return Ok(Some(frame));
                        }
                        Err(reason) => {
                            self.drop_connection();
                            reason
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            tracing::warn!(
                source = %self.connector.describe(),
                %reason,
                "connection attempt failed"
            );
            self.record_failure(reason)?;
        }
    }

    /// Count one failure; on exhausting the budget enter Failed and return the fatal error.
    fn record_failure(&mut self, reason: String) -> Result<(), StreamError> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.set_state(StreamState::Failed);
            tracing::error!(
                source = %self.connector.describe(),
                attempts = self.failures,
                last = %reason,
                "stream failed, giving up"
            );
            return Err(StreamError::Exhausted {
                attempts: self.failures,
                last: reason,
            });
        }
        Ok(())
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }

    fn drop_connection(&mut self) {
        if let Some(mut source) = self.current.take() {
            source.close();
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.drop_connection();
    }
}
