//! HTTP MJPEG frame source.
//!
//! This module provides `MjpegHttpSource` for cameras that serve MJPEG
//! (`multipart/x-mixed-replace`) or single JPEG snapshots over HTTP, such
//! as DroidCam or ESP32-S3 boards.
//!
//! The source is responsible for:
//! - Connecting to the HTTP stream
//! - Splitting the multipart body into JPEG images
//! - Decoding JPEG to RGB8 in-memory
//! - Producing `Frame` instances

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GenericImageView;

use super::{FrameSource, StreamInfo};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MjpegHttpSource {
    camera: Arc<str>,
    url: String,
    fps: f64,
    reconnect_delay: Duration,
    stream: Option<HttpStream>,
    dimensions: Option<(u32, u32)>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg(ureq::Agent),
}

impl MjpegHttpSource {
    pub fn new(camera: &str, url: &str, fps: f64) -> Self {
        Self {
            camera: Arc::from(camera),
            url: url.to_string(),
            fps,
            reconnect_delay: Duration::from_secs(2),
            stream: None,
            dimensions: None,
            connected_at: None,
            frame_count: 0,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn agent() -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build()
    }
}

impl FrameSource for MjpegHttpSource {
    fn open(&mut self) -> Result<()> {
        log::info!("[{}] opening stream {}", self.camera, self.url);
        let agent = Self::agent();
        let response = agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg(agent));
        }
        self.connected_at = Some(Instant::now());
        log::info!("[{}] stream opened", self.camera);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("stream not open"))?;
        let jpeg = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::SingleJpeg(agent) => fetch_single_jpeg(agent, &self.url)?,
        };
        let (pixels, width, height) = decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        self.dimensions = Some((width, height));
        Ok(Frame::new(Arc::clone(&self.camera), pixels, width, height))
    }

    fn reconnect(&mut self) -> Result<()> {
        log::info!("[{}] reconnecting stream", self.camera);
        self.close();
        std::thread::sleep(self.reconnect_delay);
        self.open()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!(
                "[{}] stream closed after {} frames",
                self.camera,
                self.frame_count
            );
        }
        self.connected_at = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn info(&self) -> StreamInfo {
        match (&self.stream, self.dimensions) {
            (Some(_), Some((width, height))) => StreamInfo::new(width, height, self.fps, "MJPEG"),
            _ => StreamInfo::default(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
