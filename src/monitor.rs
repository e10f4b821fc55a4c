//! Per-camera monitor loop.
//!
//! Each running camera owns one OS thread that reads a frame per tick,
//! feeds the recorder, fans JPEG copies out to live subscribers, runs the
//! classifier when motion detection is on and advances post-roll. Control
//! calls from the fleet touch only `MonitorShared`. Subscriber changes never
//! wait on the loop; disabling motion waits at most for the recorder call in
//! progress.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;

use crate::config::{CameraConfig, StreamConfig};
use crate::detect::MotionClassifier;
use crate::error::{SentryError, SentryResult};
use crate::frame::Frame;
use crate::ingest::{FrameSource, StreamInfo};
use crate::record::sink::{encode_jpeg, FrameSink};
use crate::record::{PostProcessor, Recorder, RecorderSettings, RecordingSession, SessionSummary};
use crate::shutdown::StopSignal;

/// One encoded live frame, shared by every subscriber that receives it.
pub type LiveFrame = Arc<[u8]>;

/// A live-frame channel handed to a subscriber.
pub struct Subscription {
    pub id: u64,
    pub frames: Receiver<LiveFrame>,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub subscriber_queue: usize,
    pub jpeg_quality: u8,
    /// Pause after a failed reconnect.
    pub read_failure_backoff: Duration,
}

impl From<&StreamConfig> for MonitorSettings {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            subscriber_queue: stream.subscriber_queue,
            jpeg_quality: stream.jpeg_quality,
            read_failure_backoff: stream.read_failure_backoff,
        }
    }
}

/// Collaborators a monitor is built from.
pub struct MonitorParts {
    pub source: Box<dyn FrameSource>,
    pub classifier: Box<dyn MotionClassifier>,
    pub sink: Box<dyn FrameSink>,
    pub post_processor: Option<Arc<dyn PostProcessor>>,
}

#[derive(Debug, Default)]
struct MonitorStats {
    frames_processed: AtomicU64,
    read_failures: AtomicU64,
    reconnects: AtomicU64,
    motion_events: AtomicU64,
    recordings: AtomicU64,
    dropped_live_frames: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStatsSnapshot {
    pub frames_processed: u64,
    pub read_failures: u64,
    pub reconnects: u64,
    pub motion_events: u64,
    pub recordings: u64,
    pub dropped_live_frames: u64,
}

impl MonitorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            motion_events: self.motion_events.load(Ordering::Relaxed),
            recordings: self.recordings.load(Ordering::Relaxed),
            dropped_live_frames: self.dropped_live_frames.load(Ordering::Relaxed),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: SyncSender<LiveFrame>,
}

struct Subscribers {
    list: Vec<Subscriber>,
    next_id: u64,
}

/// State shared between the loop thread and control calls.
struct MonitorShared {
    camera: String,
    settings: MonitorSettings,
    motion_detection: AtomicBool,
    /// Serializes motion toggles so each flag change is paired with its stop.
    toggle: Mutex<()>,
    subscribers: RwLock<Subscribers>,
    running: AtomicBool,
    source_open: AtomicBool,
    stream_info: RwLock<StreamInfo>,
    stats: MonitorStats,
    recorder: Recorder,
}

impl MonitorShared {
    fn subscribers(&self) -> RwLockReadGuard<'_, Subscribers> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribers_mut(&self) -> RwLockWriteGuard<'_, Subscribers> {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn motion_enabled(&self) -> bool {
        self.motion_detection.load(Ordering::SeqCst)
    }

    fn set_stream_info(&self, info: StreamInfo) {
        *self
            .stream_info
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = info;
    }
}

/// Handle to a running camera loop. Dropping it stops and joins the loop.
pub struct CameraMonitor {
    shared: Arc<MonitorShared>,
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl CameraMonitor {
    /// Open the source and spawn the loop thread. Motion detection starts
    /// enabled.
    pub fn start(
        camera: &CameraConfig,
        parts: MonitorParts,
        settings: MonitorSettings,
    ) -> SentryResult<Self> {
        let MonitorParts {
            mut source,
            classifier,
            sink,
            post_processor,
        } = parts;
        source
            .open()
            .map_err(|source| SentryError::SourceOpenFailed {
                camera: camera.name.clone(),
                source,
            })?;

        let recorder = Recorder::new(
            &camera.name,
            RecorderSettings {
                fps: camera.fps,
                pre_buffer_seconds: camera.recording.pre_buffer_seconds,
                post_buffer_seconds: camera.recording.post_buffer_seconds,
                output_dir: camera.recording.path.clone(),
            },
            sink,
            post_processor,
        );
        let shared = Arc::new(MonitorShared {
            camera: camera.name.clone(),
            settings,
            motion_detection: AtomicBool::new(true),
            toggle: Mutex::new(()),
            subscribers: RwLock::new(Subscribers {
                list: Vec::new(),
                next_id: 1,
            }),
            running: AtomicBool::new(true),
            source_open: AtomicBool::new(true),
            stream_info: RwLock::new(source.info()),
            stats: MonitorStats::default(),
            recorder,
        });

        let stop = StopSignal::new();
        let tick = camera.tick_interval();
        let worker = MonitorLoop {
            shared: Arc::clone(&shared),
            source,
            classifier,
            stop: stop.clone(),
            tick,
            frame_size: None,
        };
        let join = std::thread::Builder::new()
            .name(format!("monitor-{}", camera.name))
            .spawn(move || worker.run())
            .map_err(|e| SentryError::SourceOpenFailed {
                camera: camera.name.clone(),
                source: anyhow!("spawn monitor thread: {}", e),
            })?;

        log::info!(
            "[{}] monitor started ({} fps, pre {}s, post {}s)",
            camera.name,
            camera.fps,
            camera.recording.pre_buffer_seconds,
            camera.recording.post_buffer_seconds
        );
        Ok(Self {
            shared,
            stop,
            join: Some(join),
        })
    }

    pub fn camera(&self) -> &str {
        &self.shared.camera
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn source_open(&self) -> bool {
        self.shared.source_open.load(Ordering::SeqCst)
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.shared
            .stream_info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recorder.is_recording()
    }

    pub fn current_session(&self) -> Option<RecordingSession> {
        self.shared.recorder.current_session()
    }

    pub fn motion_detection(&self) -> bool {
        self.shared.motion_enabled()
    }

    /// Toggle motion detection. Disabling also ends an active recording;
    /// its summary is returned.
    pub fn set_motion_detection(&self, enabled: bool) -> Option<SessionSummary> {
        let _toggle = self
            .shared
            .toggle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.shared.motion_detection.store(enabled, Ordering::SeqCst);
        log::info!(
            "[{}] motion detection {}",
            self.shared.camera,
            if enabled { "enabled" } else { "disabled" }
        );
        if enabled {
            None
        } else {
            self.shared.recorder.stop()
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, frames) = mpsc::sync_channel(self.shared.settings.subscriber_queue);
        let mut subscribers = self.shared.subscribers_mut();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.list.push(Subscriber { id, tx });
        log::debug!("[{}] live subscriber {} added", self.shared.camera, id);
        Subscription { id, frames }
    }

    /// Remove a subscriber and close its channel. Unknown ids return `false`.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.shared.subscribers_mut();
        let before = subscribers.list.len();
        subscribers.list.retain(|sub| sub.id != id);
        before != subscribers.list.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().list.len()
    }

    /// Ask the loop to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.trigger();
    }

    /// Signal the loop and wait for it to finish its shutdown sequence.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("[{}] monitor thread panicked", self.shared.camera);
                self.shared.running.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for CameraMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MonitorLoop {
    shared: Arc<MonitorShared>,
    source: Box<dyn FrameSource>,
    classifier: Box<dyn MotionClassifier>,
    stop: StopSignal,
    tick: Duration,
    frame_size: Option<(u32, u32)>,
}

impl MonitorLoop {
    fn run(mut self) {
        log::info!(
            "[{}] monitor loop started (classifier {})",
            self.shared.camera,
            self.classifier.name()
        );
        while !self.stop.is_triggered() {
            let started = Instant::now();
            match self.source.read_frame() {
                Ok(frame) => {
                    let size = Some((frame.width, frame.height));
                    if self.frame_size != size {
                        // Some sources only learn their resolution from the first frame.
                        self.frame_size = size;
                        self.shared.set_stream_info(self.source.info());
                    }
                    self.process(&frame);
                    drop(frame);
                }
                Err(source) => {
                    if self.recover(source) {
                        break;
                    }
                    continue;
                }
            }
            let elapsed = started.elapsed();
            if let Some(rest) = self.tick.checked_sub(elapsed) {
                if self.stop.sleep(rest) {
                    break;
                }
            }
        }
        self.finish();
    }

    fn process(&mut self, frame: &Frame) {
        let shared = &self.shared;
        if let Err(e) = shared.recorder.add_frame(frame) {
            log::debug!("[{}] add_frame: {}", shared.camera, e);
        }
        MonitorStats::bump(&shared.stats.frames_processed);

        self.broadcast(frame);

        if shared.motion_enabled() {
            let reading = self.classifier.detect(frame);
            if reading.motion_detected {
                Self::on_motion(shared, reading.intensity);
            }
        }

        if let Some(summary) = shared.recorder.update() {
            log::debug!(
                "[{}] session {} ended after post-roll",
                shared.camera,
                summary.id
            );
        }
    }

    fn on_motion(shared: &MonitorShared, intensity: f64) {
        MonitorStats::bump(&shared.stats.motion_events);
        let was_recording = shared.recorder.is_recording();
        // The flag is re-read under the recorder lock: a disable that has
        // already stopped the recorder cannot be undone by this tick.
        match shared.recorder.start_recording_if(|| shared.motion_enabled()) {
            Ok(false) => {
                log::debug!("[{}] motion detection turned off mid-tick", shared.camera);
            }
            Ok(true) => {
                if !was_recording {
                    log::info!(
                        "[{}] motion detected (intensity {:.0}), recording",
                        shared.camera,
                        intensity
                    );
                    MonitorStats::bump(&shared.stats.recordings);
                }
                shared.recorder.on_motion();
            }
            Err(e) => log::warn!("[{}] {}", shared.camera, e),
        }
    }

    /// Encode once and offer the bytes to every subscriber without blocking.
    fn broadcast(&self, frame: &Frame) {
        let shared = &self.shared;
        if shared.subscribers().list.is_empty() || !frame.is_well_formed() {
            return;
        }
        let jpeg: LiveFrame = match encode_jpeg(frame, shared.settings.jpeg_quality) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                log::debug!("[{}] live frame encode failed: {:#}", shared.camera, e);
                return;
            }
        };
        let mut subscribers = shared.subscribers_mut();
        subscribers
            .list
            .retain(|sub| match sub.tx.try_send(Arc::clone(&jpeg)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    MonitorStats::bump(&shared.stats.dropped_live_frames);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::debug!("[{}] live subscriber {} gone", shared.camera, sub.id);
                    false
                }
            });
    }

    /// Handle a failed read: reconnect, backing off when that fails too.
    /// Returns `true` when stop was signalled during the backoff.
    fn recover(&mut self, err: anyhow::Error) -> bool {
        let shared = &self.shared;
        MonitorStats::bump(&shared.stats.read_failures);
        let err = SentryError::SourceReadFailed {
            camera: shared.camera.clone(),
            source: err,
        };
        log::warn!("{}", err);

        shared.source_open.store(false, Ordering::SeqCst);
        MonitorStats::bump(&shared.stats.reconnects);
        match self.source.reconnect() {
            Ok(()) => {
                log::info!("[{}] source reconnected", shared.camera);
                shared.source_open.store(true, Ordering::SeqCst);
                shared.set_stream_info(self.source.info());
                false
            }
            Err(e) => {
                log::warn!(
                    "[{}] reconnect failed: {:#}; retrying in {:?}",
                    shared.camera,
                    e,
                    shared.settings.read_failure_backoff
                );
                self.stop.sleep(shared.settings.read_failure_backoff)
            }
        }
    }

    /// Exit sequence: source, classifier, recorder, then the ring buffer
    /// (inside `Recorder::close`).
    fn finish(mut self) {
        let shared = &self.shared;
        self.source.close();
        shared.source_open.store(false, Ordering::SeqCst);
        shared.set_stream_info(StreamInfo::default());
        self.classifier.close();
        if let Some(summary) = shared.recorder.stop() {
            log::info!(
                "[{}] recording {} finalized on shutdown",
                shared.camera,
                summary.path.display()
            );
        }
        shared.recorder.close();
        shared.subscribers_mut().list.clear();
        shared.running.store(false, Ordering::SeqCst);
        log::info!(
            "[{}] monitor loop stopped after {} frames",
            shared.camera,
            shared.stats.frames_processed.load(Ordering::Relaxed)
        );
    }
}
