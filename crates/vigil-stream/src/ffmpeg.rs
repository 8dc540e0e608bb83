//! RTSP / file capture through an `ffmpeg` child process.
//!
//! ffmpeg decodes the feed and writes scaled raw RGB24 frames to stdout;
//! each read pulls exactly one frame. When the network drops, ffmpeg exits
//! after its socket timeout and the read sees end of data.

use crate::frame::Frame;
use crate::stream::{Connector, FrameSource, StreamError};
use chrono::Utc;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

pub struct FfmpegConnector {
    uri: String,
    /// URI safe to log.
    label: String,
    width: u32,
    height: u32,
    read_timeout: Duration,
    binary: String,
}

impl FfmpegConnector {
    pub fn new(
        uri: String,
        label: String,
        width: u32,
        height: u32,
        read_timeout: Duration,
    ) -> Self {
        Self {
            uri,
            label,
            width,
            height,
            read_timeout,
            binary: "ffmpeg".into(),
        }
    }

    /// Use a specific ffmpeg executable instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn args(&self) -> Vec<String> {
        ffmpeg_args(&self.uri, self.width, self.height, self.read_timeout)
    }
}

/// Command line for decoding `uri` to raw RGB24 at `width`x`height` on stdout.
pub fn ffmpeg_args(uri: &str, width: u32, height: u32, read_timeout: Duration) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "error".into()];
    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        args.extend([
            "-rtsp_transport".into(),
            "tcp".into(),
            "-timeout".into(),
            read_timeout.as_micros().to_string(),
        ]);
    } else if !uri.contains("://") {
        // Local recordings are paced to real time.
        args.push("-re".into());
    }
    args.extend([
        "-i".into(),
        uri.to_string(),
        "-an".into(),
        "-vf".into(),
        format!("scale={width}:{height}"),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-".into(),
    ]);
    args
}

impl Connector for FfmpegConnector {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, StreamError> {
        let mut child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StreamError::Connect(format!("failed to spawn {}: {e}", self.binary)))?;

        let Some(stdout) = child.stdout.take() else {
            reap(&mut child, &self.label);
            return Err(StreamError::Connect("ffmpeg stdout not captured".into()));
        };

        if let Some(stderr) = child.stderr.take() {
            let label = self.label.clone();
            let logger = std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        tracing::warn!(source = %label, "ffmpeg: {}", line.trim());
                    }
                });
            if let Err(e) = logger {
                reap(&mut child, &self.label);
                return Err(StreamError::Connect(format!("failed to spawn log thread: {e}")));
            }
        }

        tracing::debug!(source = %self.label, pid = child.id(), "ffmpeg started");
        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            width: self.width,
            height: self.height,
            sequence: 0,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Kill `child` and collect its exit status.
fn reap(child: &mut Child, label: &str) {
    if let Err(e) = child.kill() {
        tracing::debug!(source = %label, error = %e, "ffmpeg already exited");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(source = %label, error = %e, "failed to reap ffmpeg");
    }
}

pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    sequence: u64,
    closed: bool,
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let mut data = vec![0u8; Frame::rgb_len(self.width, self.height)];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(StreamError::Read(e.to_string())),
        }

        let frame = Frame {
            data,
            width: self.width,
            height: self.height,
            captured_at: Utc::now(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "ffmpeg already exited");
        }
        match self.child.wait() {
            Ok(status) => tracing::debug!(%status, "ffmpeg stopped"),
            Err(e) => tracing::warn!(error = %e, "failed to reap ffmpeg"),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtsp_args_use_tcp_and_timeout() {
        let args = ffmpeg_args(
            "rtsp://admin:pw@10.0.0.2:554/cam/realmonitor?channel=1&subtype=0",
            640,
            360,
            Duration::from_secs(10),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-timeout 10000000"));
        assert!(joined.contains("-vf scale=640:360"));
        assert!(joined.ends_with("-f rawvideo -pix_fmt rgb24 -"));
        assert!(!args.contains(&"-re".to_string()));
    }

    #[test]
    fn test_file_args_are_paced() {
        let args = ffmpeg_args("/tmp/door.mp4", 320, 240, Duration::from_secs(5));
        assert!(args.contains(&"-re".to_string()));
        assert!(!args.contains(&"-rtsp_transport".to_string()));
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/tmp/door.mp4");
    }

    #[test]
    fn test_http_args_not_paced() {
        let args = ffmpeg_args("http://cam.local/video.mjpg", 320, 240, Duration::from_secs(5));
        assert!(!args.contains(&"-re".to_string()));
        assert!(!args.contains(&"-rtsp_transport".to_string()));
    }

    #[test]
    fn test_missing_binary_is_connect_error() {
        let mut connector = FfmpegConnector::new(
            "rtsp://example.invalid/stream".into(),
            "test".into(),
            16,
            16,
            Duration::from_secs(1),
        )
        .with_binary(format!("/nonexistent/ffmpeg-{}", std::process::id()));
        assert!(matches!(connector.connect(), Err(StreamError::Connect(_))));
    }

    #[test]
    fn test_reap_kills_running_child() {
        let mut child = Command::new("sleep")
            .arg("60")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        reap(&mut child, "test");
        assert!(child.try_wait().unwrap().is_some());
    }
}
