use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use camera_sentry::config::MotionConfig;
use camera_sentry::fleet::{DurationProbe, HealthProbe};
use camera_sentry::record::sink::MemorySinkFactory;
use camera_sentry::{
    CameraConfig, ClassifierFactory, Fleet, FleetParts, Frame, HealthCheckResult,
    MotionClassifier, MotionReading, SentryConfig, SentryError,
};

struct AlwaysMotion;

impl MotionClassifier for AlwaysMotion {
    fn name(&self) -> &'static str {
        "always"
    }

    fn detect(&mut self, _frame: &Frame) -> MotionReading {
        MotionReading::motion(10_000.0)
    }
}

struct AlwaysMotionFactory;

impl ClassifierFactory for AlwaysMotionFactory {
    fn create(
        &self,
        _camera: &CameraConfig,
        _motion: &MotionConfig,
    ) -> Result<Box<dyn MotionClassifier>> {
        Ok(Box::new(AlwaysMotion))
    }
}

struct Healthy;

impl HealthProbe for Healthy {
    fn check(&self, _url: &str) -> HealthCheckResult {
        HealthCheckResult {
            host_reachable: true,
            url_accessible: true,
            ..HealthCheckResult::default()
        }
    }
}

struct FixedDuration;

impl DurationProbe for FixedDuration {
    fn probe(&self, _path: &Path) -> Option<Duration> {
        Some(Duration::from_secs(42))
    }
}

fn config(dir: &Path) -> SentryConfig {
    let mut config = SentryConfig::default();
    for name in ["front", "back"] {
        let mut camera = CameraConfig::named(name);
        camera.fps = 50.0;
        camera.url = format!("stub://{}?width=32&height=24", name);
        camera.recording.path = dir.to_path_buf();
        camera.recording.pre_buffer_seconds = 0.2;
        camera.recording.post_buffer_seconds = 0.2;
        config.cameras.push(camera);
    }
    config.cameras[1].enabled = false;
    config
}

fn fleet(dir: &Path) -> (Fleet, Arc<MemorySinkFactory>) {
    let config = config(dir);
    let sinks = Arc::new(MemorySinkFactory::default());
    let parts = FleetParts {
        classifiers: Arc::new(AlwaysMotionFactory),
        sinks: sinks.clone(),
        post_processor: None,
        health_probe: Arc::new(Healthy),
        duration_probe: Arc::new(FixedDuration),
        ..FleetParts::production(&config)
    };
    (Fleet::with_parts(config, parts), sinks)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn is_recording(fleet: &Fleet, name: &str) -> bool {
    fleet
        .status()
        .cameras
        .iter()
        .any(|c| c.name == name && c.recording)
}

#[test]
fn stop_camera_distinguishes_unknown_from_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let (fleet, _sinks) = fleet(dir.path());
    assert!(matches!(
        fleet.stop_camera("attic"),
        Err(SentryError::NotFound(name)) if name == "attic"
    ));
    assert!(matches!(
        fleet.stop_camera("front"),
        Err(SentryError::NotRunning(name)) if name == "front"
    ));
    assert!(matches!(
        fleet.start_camera("attic"),
        Err(SentryError::NotFound(_))
    ));
}

#[test]
fn start_enabled_skips_disabled_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let (fleet, _sinks) = fleet(dir.path());
    assert_eq!(fleet.start_enabled(), 1);
    assert_eq!(fleet.running_cameras(), vec!["front".to_string()]);

    // Disabled cameras can still be started explicitly.
    fleet.start_camera("back").unwrap();
    fleet.stop_camera("back").unwrap();
    assert!(matches!(
        fleet.stop_camera("back"),
        Err(SentryError::NotRunning(_))
    ));
}

#[test]
fn disabling_motion_finalizes_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let (fleet, sinks) = fleet(dir.path());
    fleet.start_camera("front").unwrap();
    assert!(wait_until(|| is_recording(&fleet, "front")));

    let summary = fleet
        .disable_motion_detection("front")
        .unwrap()
        .expect("an active session was stopped");
    assert!(summary.frames_written > 0);
    assert!(!is_recording(&fleet, "front"));

    // Motion stays off, so nothing restarts.
    std::thread::sleep(Duration::from_millis(100));
    let status = fleet.status();
    let front = status.cameras.iter().find(|c| c.name == "front").unwrap();
    assert!(front.running && !front.recording && !front.motion_detection);

    let log = sinks.log_for("front");
    let log = log.lock().unwrap();
    assert_eq!(log.opened.len(), 1);
    assert_eq!(log.closes, 1);

    drop(log);
    fleet.enable_motion_detection("front").unwrap();
    assert!(wait_until(|| is_recording(&fleet, "front")));
}

#[test]
fn stopping_camera_finalizes_recording_and_releases_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (fleet, sinks) = fleet(dir.path());
    fleet.start_camera("front").unwrap();
    let sub = fleet.subscribe("front").unwrap();
    let jpeg = sub.frames.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert!(wait_until(|| is_recording(&fleet, "front")));

    fleet.stop_camera("front").unwrap();
    assert!(fleet.running_cameras().is_empty());
    while sub.frames.try_recv().is_ok() {}
    assert!(sub.frames.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(!fleet.unsubscribe("front", sub.id));

    let log = sinks.log_for("front");
    let log = log.lock().unwrap();
    assert_eq!(log.opened.len(), log.closes);
}

#[test]
fn cameras_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    let (fleet, _sinks) = fleet(dir.path());
    fleet.start_camera("front").unwrap();
    fleet.start_camera("back").unwrap();
    fleet.disable_motion_detection("back").unwrap();
    fleet.stop_camera("back").unwrap();

    let frames = |fleet: &Fleet| {
        fleet.status().cameras[0]
            .stats
            .map(|s| s.frames_processed)
            .unwrap_or_default()
    };
    let before = frames(&fleet);
    assert!(wait_until(|| frames(&fleet) > before + 10));
}

#[test]
fn recordings_are_listed_with_scanned_durations() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("front_20240101_080000.mem"), b"old").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    std::fs::write(dir.path().join("back_20240101_090000.mem"), b"newer").unwrap();

    let (fleet, _sinks) = fleet(dir.path());
    fleet.start_scanners().unwrap();
    assert!(wait_until(|| {
        fleet.recordings().iter().all(|r| r.duration == "0:42") && fleet.health("back").is_some()
    }));

    let list = fleet.recordings();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].camera, "back");
    assert_eq!(list[1].camera, "front");
    assert_eq!(fleet.status().storage.recordings_bytes, 8);
    assert!(fleet.health("back").unwrap().is_healthy());
    fleet.shutdown();
}
