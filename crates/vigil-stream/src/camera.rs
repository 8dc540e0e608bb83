//! V4L2 capture via the `v4l` crate.
//!
//! Covers USB cameras and DVR outputs bridged into a local video device
//! (capture cards, v4l2loopback). YUYV is negotiated and converted to RGB.

use crate::frame::{self, Frame};
use crate::stream::{Connector, FrameSource, StreamError};
use chrono::Utc;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MMAP_BUFFERS: u32 = 4;

pub struct V4lConnector {
    device_path: String,
    width: u32,
    height: u32,
}

impl V4lConnector {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl Connector for V4lConnector {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, StreamError> {
        let source = V4lSource::open(&self.device_path, self.width, self.height)?;
        Ok(Box::new(source))
    }

    fn describe(&self) -> String {
        self.device_path.clone()
    }
}

pub struct V4lSource {
    // Declared before `device` so buffers are unmapped first.
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    sequence: u64,
}

impl V4lSource {
    fn open(device_path: &str, width: u32, height: u32) -> Result<Self, StreamError> {
        if !Path::new(device_path).exists() {
            return Err(StreamError::Connect(format!("device not found: {device_path}")));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| StreamError::Connect(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| StreamError::Connect(format!("failed to query capabilities: {e}")))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(StreamError::Connect(format!(
                "{device_path} ({}) is not a capture device",
                caps.card
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| StreamError::Connect(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| StreamError::Connect(format!("failed to set format: {e}")))?;
        if negotiated.fourcc != FourCC::new(b"YUYV") {
            return Err(StreamError::Connect(format!(
                "unsupported pixel format {:?}, need YUYV",
                negotiated.fourcc
            )));
        }

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            "opened capture device"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| StreamError::Connect(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            sequence: 0,
        })
    }
}

impl FrameSource for V4lSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let (buf, _meta) = CaptureStream::next(&mut self.stream)
            .map_err(|e| StreamError::Read(format!("failed to dequeue buffer: {e}")))?;
        let data = frame::yuyv_to_rgb(buf, self.width, self.height)
            .map_err(|e| StreamError::Read(e.to_string()))?;

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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_connect_error() {
        let mut connector = V4lConnector::new("/dev/video-does-not-exist", 640, 480);
        assert_eq!(connector.describe(), "/dev/video-does-not-exist");
        assert!(matches!(connector.connect(), Err(StreamError::Connect(_))));
    }
}
