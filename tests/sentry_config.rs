use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camera_sentry::config::SentryConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTRY_CONFIG",
        "SENTRY_RECORDING_PATH",
        "SENTRY_MOTION_THRESHOLD",
        "SENTRY_DETECTION_INTERVAL_MS",
        "SENTRY_MIN_AREA",
        "SENTRY_PRE_BUFFER_SECONDS",
        "SENTRY_POST_BUFFER_SECONDS",
        "SENTRY_FFMPEG",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "cameras": [
            {
                "name": "driveway",
                "description": "over the garage",
                "url": "http://192.168.1.20:4747/video",
                "fps": 15,
                "motion_threshold": 8000,
                "recording": {
                    "path": "/srv/clips",
                    "pre_buffer_seconds": 3,
                    "post_buffer_seconds": 6
                }
            },
            {
                "name": "porch",
                "url": "stub://porch",
                "enabled": false
            }
        ],
        "motion": { "detection_interval_ms": 250, "min_area": 800 },
        "health": { "check_interval_seconds": 10, "timeout_seconds": 2 },
        "stream": { "subscriber_queue": 3 },
        "post_process": { "transcode": false }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENTRY_CONFIG", file.path());
    std::env::set_var("SENTRY_MOTION_THRESHOLD", "12000");
    std::env::set_var("SENTRY_POST_BUFFER_SECONDS", "4.5");
    std::env::set_var("SENTRY_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");

    let cfg = SentryConfig::load().expect("load config");

    assert_eq!(cfg.cameras.len(), 2);
    let driveway = cfg.camera("driveway").unwrap();
    assert_eq!(driveway.description, "over the garage");
    assert_eq!(driveway.fps, 15.0);
    assert_eq!(driveway.motion_threshold, 12000.0);
    assert_eq!(driveway.recording.path, PathBuf::from("/srv/clips"));
    assert_eq!(driveway.recording.pre_buffer_seconds, 3.0);
    assert_eq!(driveway.recording.post_buffer_seconds, 4.5);

    let porch = cfg.camera("porch").unwrap();
    assert!(!porch.enabled);
    assert_eq!(porch.fps, 30.0);
    assert_eq!(porch.recording.path, PathBuf::from("recordings"));

    assert_eq!(cfg.motion.detection_interval_ms, 250);
    assert_eq!(cfg.motion.min_area, 800);
    assert_eq!(cfg.health.check_interval, Duration::from_secs(10));
    assert_eq!(cfg.health.timeout, Duration::from_secs(2));
    assert_eq!(cfg.stream.subscriber_queue, 3);
    assert!(!cfg.post_process.transcode);
    assert_eq!(cfg.post_process.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");

    clear_env();
}

#[test]
fn toml_files_are_supported() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [[cameras]]
        name = "yard"
        url = "stub://yard?width=64&height=48"

        [cameras.recording]
        pre_buffer_seconds = 2.0

        [durations]
        scan_interval_seconds = 120
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("SENTRY_RECORDING_PATH", "/tmp/yard-clips");
    let cfg = SentryConfig::load_from(Some(file.path())).expect("load config");

    let yard = cfg.camera("yard").unwrap();
    assert_eq!(yard.recording.pre_buffer_seconds, 2.0);
    assert_eq!(yard.recording.post_buffer_seconds, 10.0);
    assert_eq!(yard.recording.path, PathBuf::from("/tmp/yard-clips"));
    assert_eq!(cfg.duration_scan_interval, Duration::from_secs(120));

    clear_env();
}

#[test]
fn invalid_files_and_overrides_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"{"cameras": [{"name": "a/b", "url": "stub://x"}]}"#,
    )
    .expect("write config");
    assert!(SentryConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("SENTRY_MIN_AREA", "lots");
    assert!(SentryConfig::load_from(None).is_err());
    clear_env();

    let missing = file.path().with_extension("missing");
    assert!(SentryConfig::load_from(Some(&missing)).is_err());

    let cfg = SentryConfig::load_from(None).expect("defaults load");
    assert!(cfg.cameras.is_empty());
}
