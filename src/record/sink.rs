//! Frame sinks: where an active recording writes its frames.
//!
//! A sink is opened once per recording session, receives frames in order
//! and is finalized by `close`. Sinks borrow frames for the duration of
//! `write` and never keep them.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::config::CameraConfig;
use crate::frame::Frame;

pub trait FrameSink: Send {
    /// File extension (without dot) of the container this sink writes.
    fn extension(&self) -> &'static str;

    fn open(&mut self, path: &Path, fps: f64, width: u32, height: u32) -> Result<()>;

    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Finalize the file. Closing an unopened sink is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Builds the sink for a configured camera.
pub trait SinkFactory: Send + Sync {
    /// Extension of the files the created sinks write.
    fn extension(&self) -> &'static str;

    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSink>>;
}

/// Encodes an RGB8 frame to JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(frame.byte_len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            frame.pixels(),
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .context("encode jpeg")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// MJPEG file sink
// ----------------------------------------------------------------------------

/// Writes an MJPEG elementary stream: one complete JPEG image per frame.
///
/// The output carries no timing; the post-processing step supplies the
/// frame rate when converting to a timed container.
pub struct MjpegFileSink {
    quality: u8,
    open: Option<OpenFile>,
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    width: u32,
    height: u32,
    frames: u64,
}

impl MjpegFileSink {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            open: None,
        }
    }
}

impl FrameSink for MjpegFileSink {
    fn extension(&self) -> &'static str {
        "mjpeg"
    }

    fn open(&mut self, path: &Path, _fps: f64, width: u32, height: u32) -> Result<()> {
        if self.open.is_some() {
            return Err(anyhow!("sink already open"));
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("invalid sink size {}x{}", width, height));
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        self.open = Some(OpenFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            width,
            height,
            frames: 0,
        });
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| anyhow!("sink not open"))?;
        if frame.width != open.width || frame.height != open.height {
            return Err(anyhow!(
                "frame size {}x{} does not match sink size {}x{}",
                frame.width,
                frame.height,
                open.width,
                open.height
            ));
        }
        let jpeg = encode_jpeg(frame, self.quality)?;
        open.writer
            .write_all(&jpeg)
            .with_context(|| format!("write {}", open.path.display()))?;
        open.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        open.writer
            .flush()
            .with_context(|| format!("flush {}", open.path.display()))?;
        open.writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("sync {}", open.path.display()))?;
        log::debug!("sink closed {} ({} frames)", open.path.display(), open.frames);
        Ok(())
    }
}

impl Drop for MjpegFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("mjpeg sink close on drop failed: {:#}", e);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MjpegSinkFactory {
    pub quality: u8,
}

impl Default for MjpegSinkFactory {
    fn default() -> Self {
        Self { quality: 85 }
    }
}

impl SinkFactory for MjpegSinkFactory {
    fn extension(&self) -> &'static str {
        "mjpeg"
    }

    fn create(&self, _camera: &CameraConfig) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(MjpegFileSink::new(self.quality)))
    }
}

// ----------------------------------------------------------------------------
// In-memory sink
// ----------------------------------------------------------------------------

/// What an in-memory sink has seen, shared with the code that inspects it.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub opened: Vec<OpenedSink>,
    /// First pixel byte of every written frame, per session.
    pub written: Vec<Vec<u8>>,
    pub closes: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenedSink {
    pub path: PathBuf,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl SinkLog {
    pub fn frames_in_session(&self, session: usize) -> usize {
        self.written.get(session).map_or(0, Vec::len)
    }
}

/// Sink that records calls instead of writing files. Used by the demo
/// fleet and tests.
pub struct MemorySink {
    log: Arc<Mutex<SinkLog>>,
    is_open: bool,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> (Self, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        (Self::with_log(Arc::clone(&log)), log)
    }

    pub fn with_log(log: Arc<Mutex<SinkLog>>) -> Self {
        Self {
            log,
            is_open: false,
            fail_after: None,
        }
    }

    /// Fail every write once a session has received `frames` frames.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    fn log(&self) -> std::sync::MutexGuard<'_, SinkLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for MemorySink {
    fn extension(&self) -> &'static str {
        "mem"
    }

    fn open(&mut self, path: &Path, fps: f64, width: u32, height: u32) -> Result<()> {
        if self.is_open {
            return Err(anyhow!("sink already open"));
        }
        let mut log = self.log();
        log.opened.push(OpenedSink {
            path: path.to_path_buf(),
            fps,
            width,
            height,
        });
        log.written.push(Vec::new());
        drop(log);
        self.is_open = true;
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        if !self.is_open {
            return Err(anyhow!("sink not open"));
        }
        let fail_after = self.fail_after;
        let mut log = self.log();
        let session = log
            .written
            .last_mut()
            .ok_or_else(|| anyhow!("sink has no session"))?;
        if fail_after.is_some_and(|limit| session.len() >= limit) {
            return Err(anyhow!("disk full"));
        }
        session.push(frame.pixels().first().copied().unwrap_or_default());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.is_open {
            self.is_open = false;
            self.log().closes += 1;
        }
        Ok(())
    }
}

/// Hands every camera a `MemorySink` sharing one log per camera name.
#[derive(Default)]
pub struct MemorySinkFactory {
    logs: Mutex<std::collections::HashMap<String, Arc<Mutex<SinkLog>>>>,
}

impl MemorySinkFactory {
    pub fn log_for(&self, camera: &str) -> Arc<Mutex<SinkLog>> {
        let mut logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(logs.entry(camera.to_string()).or_default())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn extension(&self) -> &'static str {
        "mem"
    }

    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(MemorySink::with_log(self.log_for(&camera.name))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(shade: u8, w: u32, h: u32) -> Frame {
        Frame::new(
            Arc::from("garage"),
            vec![shade; (w * h * 3) as usize],
            w,
            h,
        )
    }

    #[test]
    fn mjpeg_sink_writes_one_jpeg_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpeg");
        let mut sink = MjpegFileSink::new(80);
        assert!(sink.write(&frame(1, 16, 16)).is_err());

        sink.open(&path, 10.0, 16, 16).unwrap();
        for shade in [10u8, 120, 240] {
            sink.write(&frame(shade, 16, 16)).unwrap();
        }
        assert!(sink.write(&frame(5, 8, 8)).is_err());
        sink.close().unwrap();
        sink.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let starts = bytes.windows(2).filter(|w| *w == [0xFF, 0xD8]).count();
        assert!(starts >= 3);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 16);
    }

    #[test]
    fn memory_sink_tracks_sessions() {
        let (mut sink, log) = MemorySink::new();
        sink.open(Path::new("a.mem"), 30.0, 4, 4).unwrap();
        sink.write(&frame(7, 4, 4)).unwrap();
        sink.close().unwrap();
        sink.open(Path::new("b.mem"), 30.0, 4, 4).unwrap();
        sink.close().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.opened.len(), 2);
        assert_eq!(log.written, vec![vec![7], vec![]]);
        assert_eq!(log.closes, 2);
    }

    #[test]
    fn memory_sink_can_fail_writes() {
        let (sink, log) = MemorySink::new();
        let mut sink = sink.failing_after(1);
        sink.open(Path::new("a.mem"), 30.0, 4, 4).unwrap();
        sink.write(&frame(1, 4, 4)).unwrap();
        assert!(sink.write(&frame(2, 4, 4)).is_err());
        assert_eq!(log.lock().unwrap().frames_in_session(0), 1);
    }
}
