use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_MOTION_THRESHOLD: f64 = 5000.0;
const DEFAULT_RECORDING_PATH: &str = "recordings";
const DEFAULT_PRE_BUFFER_SECS: f64 = 5.0;
const DEFAULT_POST_BUFFER_SECS: f64 = 10.0;
const DEFAULT_DETECTION_INTERVAL_MS: u64 = 500;
const DEFAULT_MIN_AREA: u32 = 500;
const DEFAULT_PIXEL_DELTA: u8 = 25;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DURATION_SCAN_SECS: u64 = 30;
const DEFAULT_SUBSCRIBER_QUEUE: usize = 5;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
const DEFAULT_READ_FAILURE_BACKOFF_MS: u64 = 5000;
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_FFPROBE: &str = "ffprobe";

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    motion: Option<MotionConfigFile>,
    health: Option<HealthConfigFile>,
    durations: Option<DurationsConfigFile>,
    stream: Option<StreamConfigFile>,
    post_process: Option<PostProcessConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    name: Option<String>,
    description: Option<String>,
    url: Option<String>,
    enabled: Option<bool>,
    fps: Option<f64>,
    motion_threshold: Option<f64>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    path: Option<PathBuf>,
    pre_buffer_seconds: Option<f64>,
    post_buffer_seconds: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    detection_interval_ms: Option<u64>,
    min_area: Option<u32>,
    pixel_delta: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct HealthConfigFile {
    check_interval_seconds: Option<i64>,
    timeout_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct DurationsConfigFile {
    scan_interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    subscriber_queue: Option<usize>,
    jpeg_quality: Option<u8>,
    reconnect_delay_ms: Option<u64>,
    read_failure_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PostProcessConfigFile {
    transcode: Option<bool>,
    ffmpeg_path: Option<String>,
    ffprobe_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentryConfig {
    pub cameras: Vec<CameraConfig>,
    pub motion: MotionConfig,
    pub health: HealthConfig,
    pub duration_scan_interval: Duration,
    pub stream: StreamConfig,
    pub post_process: PostProcessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraConfig {
    pub name: String,
    pub description: String,
    pub url: String,
    pub enabled: bool,
    pub fps: f64,
    /// Moving area in pixels that counts as motion.
    pub motion_threshold: f64,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingConfig {
    pub path: PathBuf,
    pub pre_buffer_seconds: f64,
    pub post_buffer_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionConfig {
    pub detection_interval_ms: u64,
    pub min_area: u32,
    pub pixel_delta: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamConfig {
    /// Bounded depth of each live-subscriber queue.
    pub subscriber_queue: usize,
    pub jpeg_quality: u8,
    pub reconnect_delay: Duration,
    /// Pause after a failed reconnect before the next tick.
    pub read_failure_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostProcessConfig {
    pub transcode: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for SentryConfig {
    fn default() -> Self {
        // An empty file yields every default.
        Self::from_file(SentryConfigFile::default())
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: DEFAULT_DETECTION_INTERVAL_MS,
            min_area: DEFAULT_MIN_AREA,
            pixel_delta: DEFAULT_PIXEL_DELTA,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            read_failure_backoff: Duration::from_millis(DEFAULT_READ_FAILURE_BACKOFF_MS),
        }
    }
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            transcode: true,
            ffmpeg_path: DEFAULT_FFMPEG.to_string(),
            ffprobe_path: DEFAULT_FFPROBE.to_string(),
        }
    }
}

impl CameraConfig {
    /// A camera with default settings and a `stub://<name>` URL.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            url: format!("stub://{}", name),
            enabled: true,
            fps: DEFAULT_FPS,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            recording: RecordingConfig {
                path: PathBuf::from(DEFAULT_RECORDING_PATH),
                pre_buffer_seconds: DEFAULT_PRE_BUFFER_SECS,
                post_buffer_seconds: DEFAULT_POST_BUFFER_SECS,
            },
        }
    }

    /// Target interval between two monitor ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl SentryConfig {
    /// Load from the file named by `SENTRY_CONFIG` (if set) and apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTRY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any) and apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|camera| camera.name == name)
    }

    fn from_file(file: SentryConfigFile) -> Self {
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(idx, camera)| {
                let name = camera.name.unwrap_or_else(|| format!("camera{}", idx + 1));
                let defaults = CameraConfig::named(&name);
                let recording = camera.recording.unwrap_or_default();
                CameraConfig {
                    url: camera.url.unwrap_or(defaults.url),
                    description: camera.description.unwrap_or_default(),
                    enabled: camera.enabled.unwrap_or(true),
                    fps: camera.fps.unwrap_or(DEFAULT_FPS),
                    motion_threshold: camera.motion_threshold.unwrap_or(DEFAULT_MOTION_THRESHOLD),
                    recording: RecordingConfig {
                        path: recording.path.unwrap_or(defaults.recording.path),
                        pre_buffer_seconds: recording
                            .pre_buffer_seconds
                            .unwrap_or(DEFAULT_PRE_BUFFER_SECS),
                        post_buffer_seconds: recording
                            .post_buffer_seconds
                            .unwrap_or(DEFAULT_POST_BUFFER_SECS),
                    },
                    name,
                }
            })
            .collect();

        let motion_file = file.motion.unwrap_or_default();
        let motion_defaults = MotionConfig::default();
        let motion = MotionConfig {
            detection_interval_ms: motion_file
                .detection_interval_ms
                .unwrap_or(motion_defaults.detection_interval_ms),
            min_area: motion_file.min_area.unwrap_or(motion_defaults.min_area),
            pixel_delta: motion_file
                .pixel_delta
                .unwrap_or(motion_defaults.pixel_delta),
        };

        // Non-positive health values fall back to defaults.
        let health_file = file.health.unwrap_or_default();
        let health = HealthConfig {
            check_interval: positive_secs(
                health_file.check_interval_seconds,
                DEFAULT_HEALTH_INTERVAL_SECS,
            ),
            timeout: positive_secs(health_file.timeout_seconds, DEFAULT_HEALTH_TIMEOUT_SECS),
        };

        let duration_scan_interval = Duration::from_secs(
            file.durations
                .and_then(|d| d.scan_interval_seconds)
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_DURATION_SCAN_SECS),
        );

        let stream_file = file.stream.unwrap_or_default();
        let stream_defaults = StreamConfig::default();
        let stream = StreamConfig {
            subscriber_queue: stream_file
                .subscriber_queue
                .unwrap_or(stream_defaults.subscriber_queue),
            jpeg_quality: stream_file
                .jpeg_quality
                .unwrap_or(stream_defaults.jpeg_quality),
            reconnect_delay: stream_file
                .reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.reconnect_delay),
            read_failure_backoff: stream_file
                .read_failure_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.read_failure_backoff),
        };

        let post_file = file.post_process.unwrap_or_default();
        let post_process = PostProcessConfig {
            transcode: post_file.transcode.unwrap_or(true),
            ffmpeg_path: post_file
                .ffmpeg_path
                .unwrap_or_else(|| DEFAULT_FFMPEG.to_string()),
            ffprobe_path: post_file
                .ffprobe_path
                .unwrap_or_else(|| DEFAULT_FFPROBE.to_string()),
        };

        Self {
            cameras,
            motion,
            health,
            duration_scan_interval,
            stream,
            post_process,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTRY_RECORDING_PATH") {
            if !path.trim().is_empty() {
                for camera in &mut self.cameras {
                    camera.recording.path = PathBuf::from(&path);
                }
            }
        }
        if let Some(threshold) = env_number::<f64>("SENTRY_MOTION_THRESHOLD")? {
            for camera in &mut self.cameras {
                camera.motion_threshold = threshold;
            }
        }
        if let Some(interval) = env_number::<u64>("SENTRY_DETECTION_INTERVAL_MS")? {
            self.motion.detection_interval_ms = interval;
        }
        if let Some(min_area) = env_number::<u32>("SENTRY_MIN_AREA")? {
            self.motion.min_area = min_area;
        }
        if let Some(seconds) = env_number::<f64>("SENTRY_PRE_BUFFER_SECONDS")? {
            for camera in &mut self.cameras {
                camera.recording.pre_buffer_seconds = seconds;
            }
        }
        if let Some(seconds) = env_number::<f64>("SENTRY_POST_BUFFER_SECONDS")? {
            for camera in &mut self.cameras {
                camera.recording.post_buffer_seconds = seconds;
            }
        }
        if let Ok(ffmpeg) = std::env::var("SENTRY_FFMPEG") {
            if !ffmpeg.trim().is_empty() {
                self.post_process.ffmpeg_path = ffmpeg;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            validate_camera_name(&camera.name)?;
            if !seen.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera name '{}'", camera.name));
            }
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera '{}' has no url", camera.name));
            }
            if !(camera.fps.is_finite() && camera.fps > 0.0) {
                return Err(anyhow!("camera '{}': fps must be > 0", camera.name));
            }
            let rec = &camera.recording;
            if rec.pre_buffer_seconds < 0.0 || rec.post_buffer_seconds < 0.0 {
                return Err(anyhow!(
                    "camera '{}': buffer seconds must not be negative",
                    camera.name
                ));
            }
        }
        if self.stream.subscriber_queue == 0 {
            return Err(anyhow!("stream.subscriber_queue must be > 0"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream.jpeg_quality must be within 1..=100"));
        }
        Ok(())
    }
}

/// Camera names become file name prefixes; keep them path-safe.
pub fn validate_camera_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("camera name must not be empty"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
        || name == "."
        || name == ".."
    {
        return Err(anyhow!("camera name '{}' is not path-safe", name));
    }
    Ok(())
}

fn positive_secs(value: Option<i64>, default: u64) -> Duration {
    match value {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => Duration::from_secs(default),
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_sparse_cameras() {
        let file: SentryConfigFile =
            serde_json::from_str(r#"{"cameras": [{"url": "http://10.0.0.2:4747/video"}]}"#)
                .unwrap();
        let cfg = SentryConfig::from_file(file);
        let camera = &cfg.cameras[0];
        assert_eq!(camera.name, "camera1");
        assert!(camera.enabled);
        assert_eq!(camera.fps, 30.0);
        assert_eq!(camera.recording.pre_buffer_seconds, 5.0);
        assert_eq!(camera.recording.post_buffer_seconds, 10.0);
        assert_eq!(cfg.health.check_interval, Duration::from_secs(30));
        assert_eq!(cfg.stream.subscriber_queue, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_positive_health_values_fall_back() {
        let file: SentryConfigFile = serde_json::from_str(
            r#"{"health": {"check_interval_seconds": 0, "timeout_seconds": -3}}"#,
        )
        .unwrap();
        let cfg = SentryConfig::from_file(file);
        assert_eq!(cfg.health, HealthConfig::default());
    }

    #[test]
    fn rejects_duplicate_and_unsafe_names() {
        let mut cfg = SentryConfig {
            cameras: vec![CameraConfig::named("a"), CameraConfig::named("a")],
            ..SentryConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.cameras = vec![CameraConfig::named("../etc")];
        assert!(cfg.validate().is_err());

        cfg.cameras = vec![CameraConfig {
            fps: 0.0,
            ..CameraConfig::named("a")
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tick_interval_follows_fps() {
        let camera = CameraConfig {
            fps: 20.0,
            ..CameraConfig::named("a")
        };
        assert_eq!(camera.tick_interval(), Duration::from_millis(50));
    }
}
