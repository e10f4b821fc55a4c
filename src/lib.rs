//! Camera Sentry
//!
//! Multi-camera motion recorder. Each camera runs an independent monitor
//! loop that keeps a pre-event ring buffer, classifies motion and records
//! clips with pre-roll and post-roll context.
//!
//! # Architecture
//!
//! Per camera, frames flow from a source through the monitor loop into the
//! ring buffer, the motion classifier and the live-subscriber fan-out, and
//! from there into the recorder and its sink:
//!
//! ```text
//! FrameSource -> CameraMonitor -> { RingBuffer, MotionClassifier, subscribers }
//!                                      -> Recorder -> FrameSink -> PostProcessor
//! ```
//!
//! Frames are exclusively owned. A consumer that keeps a frame past the
//! current tick holds its own `Frame::duplicate()`.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the pre-event `RingBuffer`
//! - `ingest`: frame sources (HTTP MJPEG, synthetic `stub://` scenes)
//! - `detect`: motion classifiers
//! - `record`: recording state machine, sinks, post-processing
//! - `monitor`: the per-camera loop
//! - `fleet`: monitor registry, status, health and duration scanners
//! - `config`: file + environment configuration

pub mod config;
pub mod detect;
pub mod error;
pub mod fleet;
pub mod frame;
pub mod ingest;
pub mod monitor;
pub mod record;
pub mod shutdown;

pub use config::{CameraConfig, SentryConfig};
pub use detect::{ClassifierFactory, MotionClassifier, MotionReading};
pub use error::{SentryError, SentryResult};
pub use fleet::{CameraStatus, Fleet, FleetParts, FleetStatus, HealthCheckResult, RecordingEntry};
pub use frame::{Frame, RingBuffer};
pub use ingest::{FrameSource, SourceFactory, StreamInfo};
pub use monitor::{CameraMonitor, LiveFrame, Subscription};
pub use record::{
    FrameSink, PostProcessor, Recorder, RecorderSettings, RecordingState, SessionSummary,
    SinkFactory, StopReason,
};
pub use shutdown::StopSignal;
