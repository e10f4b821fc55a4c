//! Frame ingestion sources.
//!
//! This module provides different sources for raw frames:
//! - HTTP MJPEG / JPEG snapshot streams (DroidCam, ESP32-style IP cameras)
//! - Synthetic `stub://` scenes (demos and tests)
//!
//! All sources produce `Frame` instances owned by the monitor loop for the
//! duration of one tick. A source MUST NOT retain a frame after handing it
//! out.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use url::Url;

use crate::config::CameraConfig;
use crate::frame::Frame;

pub mod mjpeg;
pub mod synthetic;

pub use mjpeg::MjpegHttpSource;
pub use synthetic::SyntheticSource;

/// Stream properties reported by an open source.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub resolution: String,
}

impl StreamInfo {
    pub fn new(width: u32, height: u32, fps: f64, codec: &str) -> Self {
        Self {
            width,
            height,
            fps,
            codec: codec.to_string(),
            resolution: format!("{}x{}", width, height),
        }
    }
}

/// A camera stream that yields frames one at a time.
pub trait FrameSource: Send {
    /// Connect to the stream.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame. Fails when the stream is closed or broken.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Close and reopen. Implementations may wait before reopening.
    fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Properties of the open stream; default (zeroed) when closed.
    fn info(&self) -> StreamInfo;
}

/// Builds the frame source for a configured camera.
pub trait SourceFactory: Send + Sync {
    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSource>>;
}

/// Chooses the backend from the URL scheme.
#[derive(Clone, Debug, Default)]
pub struct UrlSourceFactory {
    /// Delay between close and reopen during reconnect.
    pub reconnect_delay: std::time::Duration,
}

impl SourceFactory for UrlSourceFactory {
    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSource>> {
        if camera.url.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::new(
                &camera.name,
                synthetic::SyntheticConfig::from_url(&camera.url, camera.fps)?,
            )));
        }
        let url = Url::parse(&camera.url)
            .with_context(|| format!("parse url for camera {}", camera.name))?;
        match url.scheme() {
            "http" | "https" => Ok(Box::new(
                MjpegHttpSource::new(&camera.name, &camera.url, camera.fps)
                    .with_reconnect_delay(self.reconnect_delay),
            )),
            other => Err(anyhow!(
                "unsupported source scheme '{}' for camera {}; expected http(s) or stub",
                other,
                camera.name
            )),
        }
    }
}
