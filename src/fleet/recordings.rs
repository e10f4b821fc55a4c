//! Finished-recording listing and the duration cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::CameraConfig;

pub const UNKNOWN_DURATION: &str = "Unknown";

/// Formatted durations keyed by recording path.
pub type DurationCache = Arc<RwLock<HashMap<PathBuf, String>>>;

pub trait DurationProbe: Send + Sync {
    /// Playback length of a recording, `None` when it cannot be determined.
    fn probe(&self, path: &Path) -> Option<Duration>;
}

/// Reads the container duration with `ffprobe`.
#[derive(Clone, Debug)]
pub struct FfprobeDuration {
    ffprobe: String,
}

impl FfprobeDuration {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl DurationProbe for FfprobeDuration {
    fn probe(&self, path: &Path) -> Option<Duration> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .output()
            .map_err(|e| log::debug!("{} failed for {}: {}", self.ffprobe, path.display(), e))
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
    }
}

/// `M:SS`, or `Unknown`.
pub fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => {
            let secs = d.as_secs();
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        None => UNKNOWN_DURATION.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingEntry {
    pub name: String,
    pub path: PathBuf,
    pub camera: String,
    pub size_bytes: u64,
    /// Local modification time, `YYYY-mm-dd HH:MM:SS`.
    pub modified: String,
    pub duration: String,
}

/// Recording directories with the cameras writing into each, in config order.
fn directories(cameras: &[CameraConfig]) -> Vec<(PathBuf, Vec<&str>)> {
    let mut dirs: Vec<(PathBuf, Vec<&str>)> = Vec::new();
    for camera in cameras {
        match dirs.iter_mut().find(|(dir, _)| *dir == camera.recording.path) {
            Some((_, names)) => names.push(&camera.name),
            None => dirs.push((camera.recording.path.clone(), vec![&camera.name])),
        }
    }
    dirs
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Files are named `<camera>_<timestamp>`; the longest matching prefix wins.
fn owner<'a>(file_name: &str, names: &[&'a str]) -> &'a str {
    names
        .iter()
        .filter(|name| {
            file_name
                .strip_prefix(**name)
                .is_some_and(|rest| rest.starts_with('_'))
        })
        .max_by_key(|name| name.len())
        .or_else(|| names.first())
        .copied()
        .unwrap_or_default()
}

struct FoundFile {
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

fn files_in(dir: &Path, extension: &str) -> Vec<FoundFile> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::debug!("skipping unreadable entry under {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_extension(entry.path(), extension))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some(FoundFile {
                path: entry.path().to_path_buf(),
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect()
}

/// Every finished recording across the configured directories, newest first.
pub fn list_recordings(
    cameras: &[CameraConfig],
    extension: &str,
    cache: &DurationCache,
) -> Vec<RecordingEntry> {
    let durations = cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut found: Vec<(SystemTime, RecordingEntry)> = Vec::new();
    for (dir, names) in directories(cameras) {
        for file in files_in(&dir, extension) {
            let modified: DateTime<Local> = file.modified.into();
            let entry = RecordingEntry {
                camera: owner(&file.name, &names).to_string(),
                duration: durations
                    .get(&file.path)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_DURATION.to_string()),
                modified: modified.format("%Y-%m-%d %H:%M:%S").to_string(),
                size_bytes: file.size,
                name: file.name,
                path: file.path,
            };
            found.push((file.modified, entry));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    found.into_iter().map(|(_, entry)| entry).collect()
}

/// Total size of finished recordings, with the directories scanned.
pub fn storage_usage(cameras: &[CameraConfig], extension: &str) -> (Vec<PathBuf>, u64) {
    let mut total = 0;
    let mut scanned = Vec::new();
    for (dir, _) in directories(cameras) {
        total += files_in(&dir, extension).iter().map(|f| f.size).sum::<u64>();
        scanned.push(dir);
    }
    (scanned, total)
}

/// Probe every recording that is not cached yet or was cached as unknown,
/// then forget entries whose file is gone. Returns how many were probed.
pub fn scan_durations(
    cameras: &[CameraConfig],
    extension: &str,
    probe: &dyn DurationProbe,
    cache: &DurationCache,
) -> usize {
    let mut probed = 0;
    let mut present = HashSet::new();
    for (dir, _) in directories(cameras) {
        for file in files_in(&dir, extension) {
            present.insert(file.path.clone());
            let settled = cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&file.path)
                .is_some_and(|d| d != UNKNOWN_DURATION);
            if settled {
                continue;
            }
            let duration = format_duration(probe.probe(&file.path));
            log::debug!("duration of {}: {}", file.path.display(), duration);
            cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(file.path, duration);
            probed += 1;
        }
    }

    let mut cache = cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = cache.len();
    cache.retain(|path, _| present.contains(path));
    if cache.len() < before {
        log::debug!("dropped {} durations of removed recordings", before - cache.len());
    }
    probed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl DurationProbe for Counting {
        fn probe(&self, _path: &Path) -> Option<Duration> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(Duration::from_secs(75))
        }
    }

    fn camera(name: &str, dir: &Path) -> CameraConfig {
        let mut camera = CameraConfig::named(name);
        camera.recording.path = dir.to_path_buf();
        camera
    }

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_duration(Some(Duration::from_secs_f64(65.9))), "1:05");
        assert_eq!(format_duration(Some(Duration::from_secs(7))), "0:07");
        assert_eq!(format_duration(Some(Duration::from_secs(3600))), "60:00");
        assert_eq!(format_duration(None), "Unknown");
    }

    #[test]
    fn shared_directory_is_listed_once_with_owners() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("front_20240101_120000.mp4"), b"aaaa").unwrap();
        std::fs::write(dir.path().join("front_door_20240101_120000.mp4"), b"bb").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let cameras = vec![camera("front", dir.path()), camera("front_door", dir.path())];

        let cache = DurationCache::default();
        let list = list_recordings(&cameras, "mp4", &cache);
        assert_eq!(list.len(), 2);
        let owners: HashMap<_, _> = list
            .iter()
            .map(|e| (e.name.as_str(), e.camera.as_str()))
            .collect();
        assert_eq!(owners["front_20240101_120000.mp4"], "front");
        assert_eq!(owners["front_door_20240101_120000.mp4"], "front_door");
        assert!(list.iter().all(|e| e.duration == UNKNOWN_DURATION));

        let (dirs, bytes) = storage_usage(&cameras, "mp4");
        assert_eq!(dirs.len(), 1);
        assert_eq!(bytes, 6);
    }

    #[test]
    fn durations_are_probed_once_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yard_20240101_120000.mp4");
        std::fs::write(&path, b"x").unwrap();
        let cameras = vec![camera("yard", dir.path())];
        let cache = DurationCache::default();
        let probe = Counting(AtomicUsize::new(0));

        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 1);
        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 0);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);

        let list = list_recordings(&cameras, "mp4", &cache);
        assert_eq!(list[0].duration, "1:15");
        assert_eq!(list[0].size_bytes, 1);
    }

    struct NotYet(AtomicUsize);

    impl DurationProbe for NotYet {
        fn probe(&self, _path: &Path) -> Option<Duration> {
            match self.0.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                _ => Some(Duration::from_secs(30)),
            }
        }
    }

    #[test]
    fn unknown_durations_are_retried_and_removed_files_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yard_20240101_130000.mp4");
        std::fs::write(&path, b"x").unwrap();
        let cameras = vec![camera("yard", dir.path())];
        let cache = DurationCache::default();
        let probe = NotYet(AtomicUsize::new(0));

        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 1);
        assert_eq!(cache.read().unwrap()[&path], UNKNOWN_DURATION);
        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 1);
        assert_eq!(cache.read().unwrap()[&path], "0:30");
        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 0);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(scan_durations(&cameras, "mp4", &probe, &cache), 0);
        assert!(cache.read().unwrap().is_empty());
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let cameras = vec![camera("yard", Path::new("/nonexistent/recordings"))];
        assert!(list_recordings(&cameras, "mp4", &DurationCache::default()).is_empty());
    }
}
