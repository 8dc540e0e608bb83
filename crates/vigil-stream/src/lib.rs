//! vigil-stream: video frame sources for the recognition pipeline.
//!
//! [`StreamSource`] wraps a [`Connector`] in a reconnect state machine;
//! concrete connectors decode RTSP/file feeds through ffmpeg or read a
//! local V4L2 device.

pub mod camera;
pub mod ffmpeg;
pub mod frame;
pub mod stream;

pub use camera::V4lConnector;
pub use ffmpeg::FfmpegConnector;
pub use frame::Frame;
pub use stream::{
    Connector, FrameSource, ReconnectPolicy, Sleeper, StateObserver, StreamError, StreamSource,
    StreamState, ThreadSleeper, WatchSleeper,
};

use std::time::Duration;
use vigil_core::config::DvrConfig;

/// Connector for the configured source: `/dev/...` paths use V4L2, anything
/// else goes through ffmpeg.
pub fn connector_for(dvr: &DvrConfig) -> Box<dyn Connector> {
    let uri = dvr.stream_uri();
    if uri.starts_with("/dev/") {
        Box::new(V4lConnector::new(uri, dvr.frame_width, dvr.frame_height))
    } else {
        Box::new(FfmpegConnector::new(
            uri,
            dvr.redacted_uri(),
            dvr.frame_width,
            dvr.frame_height,
            Duration::from_secs(dvr.read_timeout_secs),
        ))
    }
}

/// Reconnect policy from the `[dvr]` settings.
pub fn reconnect_policy(dvr: &DvrConfig) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: dvr.max_reconnect_attempts,
        initial_backoff: Duration::from_millis(dvr.backoff_initial_ms),
        max_backoff: Duration::from_millis(dvr.backoff_max_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_for_redacts_rtsp_password() {
        let dvr = DvrConfig {
            password: "s3cret".into(),
            ..DvrConfig::default()
        };
        let description = connector_for(&dvr).describe();
        assert!(description.starts_with("rtsp://admin:****@"));
        assert!(!description.contains("s3cret"));
    }

    #[test]
    fn test_connector_for_local_device() {
        let dvr = DvrConfig {
            uri: "/dev/video0".into(),
            ..DvrConfig::default()
        };
        assert_eq!(connector_for(&dvr).describe(), "/dev/video0");
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let policy = reconnect_policy(&DvrConfig::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }
}
