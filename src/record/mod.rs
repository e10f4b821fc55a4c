//! Recording state machine.
//!
//! A `Recorder` owns one camera's pre-event ring buffer and at most one
//! active recording session. States are `Idle` and `Recording`; post-roll is
//! the frames-since-motion counter inside a session. Post-roll length is
//! counted in `update()` calls, one per processed frame tick.
//!
//! Locking: `Recorder::state` guards the session and the sink; the ring
//! buffer carries its own lock. When both are needed the session lock is
//! taken first. Queries read `published`, a copy of the session refreshed
//! under the session lock, so they never wait on a sink write.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{SentryError, SentryResult};
use crate::frame::{frames_for, Frame, RingBuffer};

pub mod post;
pub mod sink;

pub use post::{spawn_post_process, FfmpegTranscoder, FinishedRecording, PostProcessor};
pub use sink::{FrameSink, MemorySink, MjpegFileSink, SinkFactory};

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderSettings {
    pub fps: f64,
    pub pre_buffer_seconds: f64,
    pub post_buffer_seconds: f64,
    pub output_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// No motion for the whole post-roll window.
    PostRollExpired,
    /// Explicit stop (motion detection disabled, camera stopped).
    Stopped,
    /// Sink failure; the file is not handed to post-processing.
    Aborted,
}

/// Snapshot of the active recording.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSession {
    pub id: String,
    pub started_at: SystemTime,
    pub path: PathBuf,
    pub frames_written: u64,
    pub frames_since_motion: usize,
}

/// Returned once per session when it ends.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    pub frames_written: u64,
    pub duration: Duration,
    pub reason: StopReason,
}

struct ActiveSession {
    session: RecordingSession,
    started: Instant,
    /// Dimensions the sink was opened with; `None` until the first frame
    /// arrives when recording started from an empty zero-capacity buffer.
    sink_size: Option<(u32, u32)>,
    /// Live frames dropped because their size differs from `sink_size`.
    frames_skipped: u64,
}

struct RecorderInner {
    sink: Box<dyn FrameSink>,
    active: Option<ActiveSession>,
    sessions_started: u64,
    last_stamp: Option<String>,
    closed: bool,
}

pub struct Recorder {
    camera: Arc<str>,
    settings: RecorderSettings,
    post_roll_frames: usize,
    buffer: RingBuffer,
    state: Mutex<RecorderInner>,
    published: RwLock<Option<RecordingSession>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl Recorder {
    pub fn new(
        camera: &str,
        settings: RecorderSettings,
        sink: Box<dyn FrameSink>,
        post_processor: Option<Arc<dyn PostProcessor>>,
    ) -> Self {
        let buffer = RingBuffer::for_window(settings.fps, settings.pre_buffer_seconds);
        let post_roll_frames = frames_for(settings.fps, settings.post_buffer_seconds);
        Self {
            camera: Arc::from(camera),
            settings,
            post_roll_frames,
            buffer,
            state: Mutex::new(RecorderInner {
                sink,
                active: None,
                sessions_started: 0,
                last_stamp: None,
                closed: false,
            }),
            published: RwLock::new(None),
            post_processor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderInner> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &RecorderInner) {
        *self
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            inner.active.as_ref().map(|a| a.session.clone());
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// Number of `update()` calls without motion that end a session.
    pub fn post_roll_frames(&self) -> usize {
        self.post_roll_frames
    }

    pub fn state(&self) -> RecordingState {
        let published = self
            .published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if published.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecordingState::Recording
    }

    pub fn current_session(&self) -> Option<RecordingSession> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Begin a session, writing the buffered frames first.
    ///
    /// Succeeds without effect while already recording.
    pub fn start_recording(&self) -> SentryResult<()> {
        self.start_recording_if(|| true).map(drop)
    }

    /// Like `start_recording`, but a new session only begins when `allowed`
    /// returns `true`. `allowed` runs under the session lock, so a flag
    /// cleared before a `stop()` can never let a session start after it.
    /// Returns whether a session is active afterwards.
    pub fn start_recording_if(&self, allowed: impl FnOnce() -> bool) -> SentryResult<bool> {
        let camera = self.camera.to_string();
        let mut inner = self.lock();
        if inner.closed {
            return Err(SentryError::NotRunning(camera));
        }
        if inner.active.is_some() {
            return Ok(true);
        }
        if !allowed() {
            return Ok(false);
        }

        let dims = self.buffer.first_valid_dimensions();
        if dims.is_none() && self.buffer.capacity() > 0 {
            return Err(SentryError::NoPreBufferFrames(camera));
        }

        let (path, stamp) = self.next_path(
            inner.sink.extension(),
            inner.sessions_started + 1,
            inner.last_stamp.as_deref(),
        );
        std::fs::create_dir_all(&self.settings.output_dir).map_err(|e| {
            SentryError::SinkOpenFailed {
                camera: camera.clone(),
                path: path.clone(),
                source: anyhow::Error::new(e).context("create output directory"),
            }
        })?;

        let mut frames_written = 0u64;
        if let Some((width, height)) = dims {
            inner
                .sink
                .open(&path, self.settings.fps, width, height)
                .map_err(|source| SentryError::SinkOpenFailed {
                    camera: camera.clone(),
                    path: path.clone(),
                    source,
                })?;

            let sink = &mut inner.sink;
            let mut result = Ok(());
            self.buffer.drain_with(|frame| {
                if result.is_err() || frame.width != width || frame.height != height {
                    return;
                }
                result = sink.write(frame);
                if result.is_ok() {
                    frames_written += 1;
                }
            });
            if let Err(source) = result {
                if let Err(e) = inner.sink.close() {
                    log::warn!("[{}] closing sink after failed pre-buffer write: {:#}", camera, e);
                }
                return Err(SentryError::SinkWriteFailed {
                    camera,
                    path,
                    source,
                });
            }
        }

        inner.sessions_started += 1;
        inner.last_stamp = Some(stamp);
        let id = format!("{}-{}", self.camera, inner.sessions_started);
        log::info!(
            "[{}] started recording {} ({} pre-buffered frames)",
            self.camera,
            path.display(),
            frames_written
        );
        inner.active = Some(ActiveSession {
            session: RecordingSession {
                id,
                started_at: SystemTime::now(),
                path,
                frames_written,
                frames_since_motion: 0,
            },
            started: Instant::now(),
            sink_size: dims,
            frames_skipped: 0,
        });
        self.publish(&inner);
        Ok(true)
    }

    /// Buffer a copy of the frame and, while recording, write it to the sink.
    ///
    /// Frames whose size differs from the open sink are buffered but not
    /// written. A sink failure aborts the session and leaves the recorder
    /// idle.
    pub fn add_frame(&self, frame: &Frame) -> SentryResult<()> {
        let mut inner = self.lock();
        self.buffer.insert(frame.duplicate());

        let Some(active) = inner.active.as_mut() else {
            return Ok(());
        };
        if frame.is_empty() {
            return Ok(());
        }
        let path = active.session.path.clone();
        let needs_open = match active.sink_size {
            None => {
                active.sink_size = Some((frame.width, frame.height));
                true
            }
            Some(size) if size != (frame.width, frame.height) => {
                if active.frames_skipped == 0 {
                    log::debug!(
                        "[{}] skipping {}x{} frames while recording {}x{} to {}",
                        self.camera,
                        frame.width,
                        frame.height,
                        size.0,
                        size.1,
                        path.display()
                    );
                }
                active.frames_skipped += 1;
                return Ok(());
            }
            Some(_) => false,
        };

        let written = if needs_open {
            inner
                .sink
                .open(&path, self.settings.fps, frame.width, frame.height)
                .map_err(|source| SentryError::SinkOpenFailed {
                    camera: self.camera.to_string(),
                    path: path.clone(),
                    source,
                })
        } else {
            Ok(())
        }
        .and_then(|()| {
            inner
                .sink
                .write(frame)
                .map_err(|source| SentryError::SinkWriteFailed {
                    camera: self.camera.to_string(),
                    path: path.clone(),
                    source,
                })
        });

        match written {
            Ok(()) => {
                if let Some(active) = inner.active.as_mut() {
                    active.session.frames_written += 1;
                }
                self.publish(&inner);
                Ok(())
            }
            Err(err) => {
                log::error!("[{}] {}; aborting recording", self.camera, err);
                self.finish(&mut inner, StopReason::Aborted);
                Err(err)
            }
        }
    }

    /// Motion seen: restart the post-roll window.
    pub fn on_motion(&self) {
        let mut inner = self.lock();
        if let Some(active) = inner.active.as_mut() {
            active.session.frames_since_motion = 0;
            self.publish(&inner);
        }
    }

    /// Advance post-roll by one tick. Returns the summary when this call
    /// ended the session.
    pub fn update(&self) -> Option<SessionSummary> {
        let mut inner = self.lock();
        let active = inner.active.as_mut()?;
        active.session.frames_since_motion += 1;
        if active.session.frames_since_motion >= self.post_roll_frames {
            return self.finish(&mut inner, StopReason::PostRollExpired);
        }
        self.publish(&inner);
        None
    }

    /// End the active session, if any.
    pub fn stop(&self) -> Option<SessionSummary> {
        let mut inner = self.lock();
        self.finish(&mut inner, StopReason::Stopped)
    }

    /// Stop and release the ring buffer. The recorder is unusable afterwards.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            self.finish(&mut inner, StopReason::Stopped);
            inner.closed = true;
        }
        self.buffer.close();
    }

    fn finish(&self, inner: &mut RecorderInner, reason: StopReason) -> Option<SessionSummary> {
        let active = inner.active.take()?;
        self.publish(inner);
        let mut hand_off = reason != StopReason::Aborted;
        if active.sink_size.is_some() {
            if let Err(e) = inner.sink.close() {
                log::error!(
                    "[{}] failed to finalize {}: {:#}",
                    self.camera,
                    active.session.path.display(),
                    e
                );
                hand_off = false;
            }
        } else {
            hand_off = false;
        }

        let summary = SessionSummary {
            id: active.session.id,
            path: active.session.path,
            frames_written: active.session.frames_written,
            duration: active.started.elapsed(),
            reason,
        };
        log::info!(
            "[{}] stopped recording {} ({:?}, {} frames, {:.1}s)",
            self.camera,
            summary.path.display(),
            reason,
            summary.frames_written,
            summary.duration.as_secs_f64()
        );
        if active.frames_skipped > 0 {
            log::warn!(
                "[{}] {} frames with a different resolution were left out of {}",
                self.camera,
                active.frames_skipped,
                summary.path.display()
            );
        }

        if hand_off && summary.frames_written > 0 {
            if let Some(processor) = &self.post_processor {
                spawn_post_process(
                    Arc::clone(processor),
                    FinishedRecording {
                        camera: self.camera.to_string(),
                        session_id: summary.id.clone(),
                        path: summary.path.clone(),
                        fps: self.settings.fps,
                        frames: summary.frames_written,
                    },
                );
            }
        }
        Some(summary)
    }

    /// `<dir>/<camera>_<YYYYmmdd_HHMMSS>.<ext>`, suffixed with the session
    /// number when that name is taken or an earlier session started in the
    /// same second.
    fn next_path(
        &self,
        extension: &str,
        session: u64,
        last_stamp: Option<&str>,
    ) -> (PathBuf, String) {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir: &Path = &self.settings.output_dir;
        let mut path = dir.join(format!("{}_{}.{}", self.camera, stamp, extension));
        if path.exists() || last_stamp == Some(stamp.as_str()) {
            path = dir.join(format!("{}_{}_{}.{}", self.camera, stamp, session, extension));
        }
        (path, stamp)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close();
    }
}
