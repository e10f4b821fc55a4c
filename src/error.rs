//! Error taxonomy for the recording pipeline and the fleet control surface.
//!
//! Collaborators (sources, sinks, classifiers, probes) report failures as
//! `anyhow::Error`. The core wraps those into `SentryError` with the camera
//! name attached, so control-call callers can match on the failure kind.

use std::path::PathBuf;

use thiserror::Error;

pub type SentryResult<T> = std::result::Result<T, SentryError>;

#[derive(Debug, Error)]
pub enum SentryError {
    /// Camera name is not present in the configuration.
    #[error("camera {0} not found")]
    NotFound(String),

    #[error("camera {0} is already running")]
    AlreadyRunning(String),

    #[error("camera {0} is not running")]
    NotRunning(String),

    #[error("camera {camera}: failed to open source: {source:#}")]
    SourceOpenFailed {
        camera: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("camera {camera}: failed to read frame: {source:#}")]
    SourceReadFailed {
        camera: String,
        #[source]
        source: anyhow::Error,
    },

    /// Recording cannot start: the pre-event buffer holds no frame to size the sink.
    #[error("camera {0}: no valid frames in pre-buffer")]
    NoPreBufferFrames(String),

    #[error("camera {camera}: failed to open sink {}: {source:#}", path.display())]
    SinkOpenFailed {
        camera: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("camera {camera}: failed to write frame to {}: {source:#}", path.display())]
    SinkWriteFailed {
        camera: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("post-processing of {} failed: {source:#}", path.display())]
    PostProcessFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SentryError {
    /// True for state mismatches the caller can recover from by retrying later.
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            SentryError::AlreadyRunning(_) | SentryError::NotRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_camera_and_cause() {
        let err = SentryError::SourceOpenFailed {
            camera: "porch".to_string(),
            source: anyhow::anyhow!("connection refused"),
        };
        assert_eq!(
            err.to_string(),
            "camera porch: failed to open source: connection refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn state_mismatches_are_declined_not_fatal() {
        assert!(SentryError::AlreadyRunning("a".into()).is_declined());
        assert!(SentryError::NotRunning("a".into()).is_declined());
        assert!(!SentryError::NotFound("a".into()).is_declined());
        assert!(!SentryError::NoPreBufferFrames("a".into()).is_declined());
    }
}
