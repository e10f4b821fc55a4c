//! Post-processing of finalized recordings.
//!
//! After a session's sink is closed, the finished file is handed by value
//! to a one-shot background thread. Failures are logged and never reach the
//! recorder.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::SentryError;

/// A finalized recording ready for post-processing.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedRecording {
    pub camera: String,
    pub session_id: String,
    pub path: PathBuf,
    pub fps: f64,
    pub frames: u64,
}

pub trait PostProcessor: Send + Sync {
    /// Extension of the files this processor leaves behind, when it
    /// replaces the sink's output.
    fn output_extension(&self) -> Option<&'static str> {
        None
    }

    /// Process the recording, returning the path of the resulting file.
    fn process(&self, recording: &FinishedRecording) -> Result<PathBuf>;
}

/// Run `processor` on a detached thread. Errors are logged only.
pub fn spawn_post_process(processor: Arc<dyn PostProcessor>, recording: FinishedRecording) {
    let name = format!("postproc-{}", recording.session_id);
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        match processor.process(&recording) {
            Ok(output) => log::info!(
                "[{}] post-processed {} -> {}",
                recording.camera,
                recording.path.display(),
                output.display()
            ),
            Err(source) => {
                let err = SentryError::PostProcessFailed {
                    path: recording.path.clone(),
                    source,
                };
                log::error!("[{}] {}", recording.camera, err);
            }
        }
    });
    if let Err(e) = spawned {
        log::error!("failed to spawn post-processing thread: {}", e);
    }
}

/// Converts MJPEG recordings to H.264 MP4 with the `ffmpeg` CLI and deletes
/// the source on success.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn command(&self, input: &Path, output: &Path, fps: f64) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .args(["-loglevel", "error"])
            .args(["-f", "mjpeg"])
            .arg("-framerate")
            .arg(format!("{}", fps))
            .arg("-i")
            .arg(input)
            .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23"])
            .args(["-pix_fmt", "yuv420p"])
            .arg("-y")
            .arg(output);
        cmd
    }
}

impl PostProcessor for FfmpegTranscoder {
    fn output_extension(&self) -> Option<&'static str> {
        Some("mp4")
    }

    fn process(&self, recording: &FinishedRecording) -> Result<PathBuf> {
        let input = &recording.path;
        let output = input.with_extension("mp4");
        log::info!(
            "[{}] converting {} to mp4",
            recording.camera,
            input.display()
        );
        let result = self
            .command(input, &output, recording.fps)
            .output()
            .with_context(|| format!("run {}", self.ffmpeg))?;
        if !result.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.ffmpeg,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ));
        }
        if let Err(e) = std::fs::remove_file(input) {
            log::warn!(
                "[{}] failed to delete {} after conversion: {}",
                recording.camera,
                input.display(),
                e
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Forward(std::sync::Mutex<mpsc::Sender<PathBuf>>);

    impl PostProcessor for Forward {
        fn process(&self, recording: &FinishedRecording) -> Result<PathBuf> {
            self.0
                .lock()
                .unwrap()
                .send(recording.path.clone())
                .map_err(|_| anyhow!("receiver gone"))?;
            Ok(recording.path.clone())
        }
    }

    fn recording(path: &str) -> FinishedRecording {
        FinishedRecording {
            camera: "drive".to_string(),
            session_id: "drive-1".to_string(),
            path: PathBuf::from(path),
            fps: 15.0,
            frames: 42,
        }
    }

    #[test]
    fn spawned_processor_receives_path_by_value() {
        let (tx, rx) = mpsc::channel();
        spawn_post_process(
            Arc::new(Forward(std::sync::Mutex::new(tx))),
            recording("/tmp/drive_1.mjpeg"),
        );
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, PathBuf::from("/tmp/drive_1.mjpeg"));
    }

    #[test]
    fn transcoder_builds_timed_conversion() {
        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let cmd = transcoder.command(Path::new("in.mjpeg"), Path::new("in.mp4"), 15.0);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let framerate = args.iter().position(|a| a == "-framerate").unwrap();
        assert_eq!(args[framerate + 1], "15");
        assert_eq!(args.last().map(String::as_str), Some("in.mp4"));
        assert_eq!(transcoder.output_extension(), Some("mp4"));
    }

    #[test]
    fn missing_ffmpeg_is_an_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        assert!(transcoder.process(&recording("/tmp/missing.mjpeg")).is_err());
    }
}
