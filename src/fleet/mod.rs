//! Fleet manager: the registry of camera monitors and the control surface.
//!
//! The fleet owns every piece of cross-camera state (monitor registry,
//! health cache, duration cache) and hands the caches to its scanner
//! threads by `Arc`. Dropping the fleet shuts everything down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::config::{CameraConfig, SentryConfig};
use crate::detect::{ClassifierFactory, FrameDiffFactory};
use crate::error::{SentryError, SentryResult};
use crate::ingest::{SourceFactory, StreamInfo, UrlSourceFactory};
use crate::monitor::{
    CameraMonitor, MonitorParts, MonitorSettings, MonitorStatsSnapshot, Subscription,
};
use crate::record::sink::{MjpegSinkFactory, SinkFactory};
use crate::record::{FfmpegTranscoder, PostProcessor, SessionSummary};
use crate::shutdown::StopSignal;

pub mod health;
pub mod recordings;

pub use health::{HealthCache, HealthCheckResult, HealthProbe, TcpHttpProbe};
pub use recordings::{DurationCache, DurationProbe, FfprobeDuration, RecordingEntry};

/// Collaborator factories and probes used by a fleet.
pub struct FleetParts {
    pub sources: Arc<dyn SourceFactory>,
    pub classifiers: Arc<dyn ClassifierFactory>,
    pub sinks: Arc<dyn SinkFactory>,
    pub post_processor: Option<Arc<dyn PostProcessor>>,
    pub health_probe: Arc<dyn HealthProbe>,
    pub duration_probe: Arc<dyn DurationProbe>,
}

impl FleetParts {
    /// URL-dispatched sources, frame-diff motion, MJPEG files, optional
    /// ffmpeg transcoding and network/ffprobe probes.
    pub fn production(config: &SentryConfig) -> Self {
        let post_processor: Option<Arc<dyn PostProcessor>> = if config.post_process.transcode {
            Some(Arc::new(FfmpegTranscoder::new(
                config.post_process.ffmpeg_path.clone(),
            )))
        } else {
            None
        };
        Self {
            sources: Arc::new(UrlSourceFactory {
                reconnect_delay: config.stream.reconnect_delay,
            }),
            classifiers: Arc::new(FrameDiffFactory),
            sinks: Arc::new(MjpegSinkFactory::default()),
            post_processor,
            health_probe: Arc::new(TcpHttpProbe::new(config.health.timeout)),
            duration_probe: Arc::new(FfprobeDuration::new(
                config.post_process.ffprobe_path.clone(),
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub running: bool,
    pub source_open: bool,
    pub recording: bool,
    pub motion_detection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MonitorStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckResult>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StorageSummary {
    pub directories: Vec<PathBuf>,
    pub recordings_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FleetStatus {
    pub version: &'static str,
    pub cameras: Vec<CameraStatus>,
    pub storage: StorageSummary,
}

pub struct Fleet {
    config: SentryConfig,
    parts: FleetParts,
    monitors: RwLock<HashMap<String, CameraMonitor>>,
    health: HealthCache,
    durations: DurationCache,
    scanners: Mutex<Vec<JoinHandle<()>>>,
    stop: StopSignal,
}

impl Fleet {
    pub fn new(config: SentryConfig) -> Self {
        let parts = FleetParts::production(&config);
        Self::with_parts(config, parts)
    }

    pub fn with_parts(config: SentryConfig, parts: FleetParts) -> Self {
        Self {
            config,
            parts,
            monitors: RwLock::new(HashMap::new()),
            health: HealthCache::default(),
            durations: DurationCache::default(),
            scanners: Mutex::new(Vec::new()),
            stop: StopSignal::new(),
        }
    }

    pub fn config(&self) -> &SentryConfig {
        &self.config
    }

    fn monitors(&self) -> RwLockReadGuard<'_, HashMap<String, CameraMonitor>> {
        self.monitors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn monitors_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, CameraMonitor>> {
        self.monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn camera_config(&self, name: &str) -> SentryResult<&CameraConfig> {
        self.config
            .camera(name)
            .ok_or_else(|| SentryError::NotFound(name.to_string()))
    }

    /// Extension of finished recordings: the post-processor's output when
    /// one is configured, the sink's otherwise.
    pub fn recording_extension(&self) -> &'static str {
        self.parts
            .post_processor
            .as_ref()
            .and_then(|p| p.output_extension())
            .unwrap_or_else(|| self.parts.sinks.extension())
    }

    /// Start the health and duration scanner threads. Both run a first pass
    /// immediately.
    pub fn start_scanners(&self) -> std::io::Result<()> {
        let mut scanners = self
            .scanners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !scanners.is_empty() {
            return Ok(());
        }

        let targets: Vec<(String, String)> = self
            .config
            .cameras
            .iter()
            .map(|c| (c.name.clone(), c.url.clone()))
            .collect();
        let probe = Arc::clone(&self.parts.health_probe);
        let cache = Arc::clone(&self.health);
        scanners.push(spawn_periodic(
            "health-scanner",
            self.config.health.check_interval,
            self.stop.clone(),
            move || health::check_all(&targets, probe.as_ref(), &cache),
        )?);

        let cameras = self.config.cameras.clone();
        let extension = self.recording_extension();
        let probe = Arc::clone(&self.parts.duration_probe);
        let cache = Arc::clone(&self.durations);
        scanners.push(spawn_periodic(
            "duration-scanner",
            self.config.duration_scan_interval,
            self.stop.clone(),
            move || {
                let probed = recordings::scan_durations(&cameras, extension, probe.as_ref(), &cache);
                if probed > 0 {
                    log::debug!("duration scan probed {} recordings", probed);
                }
            },
        )?);
        log::info!(
            "scanners started (health every {:?}, durations every {:?})",
            self.config.health.check_interval,
            self.config.duration_scan_interval
        );
        Ok(())
    }

    pub fn start_camera(&self, name: &str) -> SentryResult<()> {
        let camera = self.camera_config(name)?;
        if self.monitors().get(name).is_some_and(CameraMonitor::is_running) {
            return Err(SentryError::AlreadyRunning(name.to_string()));
        }

        log::info!("[{}] starting monitor for {}", name, camera.url);
        let parts = self.build_parts(camera)?;
        let monitor =
            CameraMonitor::start(camera, parts, MonitorSettings::from(&self.config.stream))?;

        // Opening the source happens outside the registry lock; re-check.
        let mut monitors = self.monitors_mut();
        if monitors.get(name).is_some_and(CameraMonitor::is_running) {
            drop(monitors);
            monitor.stop();
            return Err(SentryError::AlreadyRunning(name.to_string()));
        }
        let stale = monitors.insert(name.to_string(), monitor);
        drop(monitors);
        if let Some(stale) = stale {
            stale.stop();
        }
        Ok(())
    }

    fn build_parts(&self, camera: &CameraConfig) -> SentryResult<MonitorParts> {
        let source =
            self.parts
                .sources
                .create(camera)
                .map_err(|source| SentryError::SourceOpenFailed {
                    camera: camera.name.clone(),
                    source,
                })?;
        let classifier = self
            .parts
            .classifiers
            .create(camera, &self.config.motion)
            .map_err(|e| SentryError::Config(format!("camera {}: {:#}", camera.name, e)))?;
        let sink = self
            .parts
            .sinks
            .create(camera)
            .map_err(|e| SentryError::Config(format!("camera {}: {:#}", camera.name, e)))?;
        Ok(MonitorParts {
            source,
            classifier,
            sink,
            post_processor: self.parts.post_processor.clone(),
        })
    }

    /// Remove the monitor and wait for its loop to finish. The registry lock
    /// is released before joining.
    pub fn stop_camera(&self, name: &str) -> SentryResult<()> {
        self.camera_config(name)?;
        let monitor = self
            .monitors_mut()
            .remove(name)
            .ok_or_else(|| SentryError::NotRunning(name.to_string()))?;
        monitor.stop();
        log::info!("[{}] camera stopped", name);
        Ok(())
    }

    /// Run `f` against a running monitor under the registry read lock.
    fn with_monitor<T>(
        &self,
        name: &str,
        f: impl FnOnce(&CameraMonitor) -> T,
    ) -> SentryResult<T> {
        self.camera_config(name)?;
        let monitors = self.monitors();
        match monitors.get(name) {
            Some(monitor) if monitor.is_running() => Ok(f(monitor)),
            _ => Err(SentryError::NotRunning(name.to_string())),
        }
    }

    pub fn enable_motion_detection(&self, name: &str) -> SentryResult<()> {
        self.with_monitor(name, |monitor| {
            monitor.set_motion_detection(true);
        })
    }

    /// Turn motion detection off, finalizing an active recording.
    pub fn disable_motion_detection(&self, name: &str) -> SentryResult<Option<SessionSummary>> {
        self.with_monitor(name, |monitor| monitor.set_motion_detection(false))
    }

    pub fn subscribe(&self, name: &str) -> SentryResult<Subscription> {
        self.with_monitor(name, CameraMonitor::subscribe)
    }

    /// Unknown cameras or ids are ignored and return `false`.
    pub fn unsubscribe(&self, name: &str, id: u64) -> bool {
        self.monitors()
            .get(name)
            .is_some_and(|monitor| monitor.unsubscribe(id))
    }

    pub fn running_cameras(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .monitors()
            .iter()
            .filter(|(_, monitor)| monitor.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn health(&self, name: &str) -> Option<HealthCheckResult> {
        self.health
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Every configured camera, merged with live monitor state and the last
    /// health result.
    pub fn status(&self) -> FleetStatus {
        let cameras = {
            let monitors = self.monitors();
            let health = self
                .health
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.config
                .cameras
                .iter()
                .map(|camera| {
                    let mut status = CameraStatus {
                        name: camera.name.clone(),
                        description: camera.description.clone(),
                        enabled: camera.enabled,
                        running: false,
                        source_open: false,
                        recording: false,
                        motion_detection: false,
                        recording_path: None,
                        stream: None,
                        stats: None,
                        health: health.get(&camera.name).cloned(),
                    };
                    if let Some(monitor) = monitors.get(&camera.name) {
                        status.running = monitor.is_running();
                        status.source_open = monitor.source_open();
                        status.motion_detection = monitor.motion_detection();
                        status.recording_path = monitor.current_session().map(|s| s.path);
                        status.recording = status.recording_path.is_some();
                        status.stream = Some(monitor.stream_info()).filter(|info| info.width > 0);
                        status.stats = Some(monitor.stats());
                    }
                    status
                })
                .collect()
        };

        let (directories, recordings_bytes) =
            recordings::storage_usage(&self.config.cameras, self.recording_extension());
        FleetStatus {
            version: env!("CARGO_PKG_VERSION"),
            cameras,
            storage: StorageSummary {
                directories,
                recordings_bytes,
            },
        }
    }

    /// Finished recordings, newest first.
    pub fn recordings(&self) -> Vec<RecordingEntry> {
        recordings::list_recordings(
            &self.config.cameras,
            self.recording_extension(),
            &self.durations,
        )
    }

    /// Start every camera configured as enabled. Failures are logged and
    /// skipped. Returns the number started.
    pub fn start_enabled(&self) -> usize {
        let mut started = 0;
        for camera in self.config.cameras.iter().filter(|c| c.enabled) {
            match self.start_camera(&camera.name) {
                Ok(()) => started += 1,
                Err(e) => log::error!("[{}] failed to start monitor: {}", camera.name, e),
            }
        }
        started
    }

    /// Stop scanners and every monitor.
    pub fn shutdown(&self) {
        self.stop.trigger();
        let scanners: Vec<JoinHandle<()>> = self
            .scanners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for scanner in scanners {
            if scanner.join().is_err() {
                log::error!("scanner thread panicked");
            }
        }

        let monitors: Vec<CameraMonitor> = self.monitors_mut().drain().map(|(_, m)| m).collect();
        // Signal all first so loops wind down in parallel.
        for monitor in &monitors {
            monitor.signal_stop();
        }
        for monitor in monitors {
            log::info!("[{}] stopping monitor", monitor.camera());
            monitor.stop();
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `job` now and then every `interval` until `stop` fires.
fn spawn_periodic(
    name: &str,
    interval: Duration,
    stop: StopSignal,
    mut job: impl FnMut() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            if stop.is_triggered() {
                break;
            }
            job();
            if stop.sleep(interval) {
                break;
            }
        })
}
