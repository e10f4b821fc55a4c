//! Motion classification.
//!
//! A classifier consumes frames and reports whether motion occurred plus an
//! intensity score (changed area in pixels for the built-in classifier).
//! Classifiers are rate limited: calls inside the configured minimum
//! interval return "no motion" without touching classifier state.

use anyhow::Result;

use crate::config::{CameraConfig, MotionConfig};
use crate::frame::Frame;

mod diff;

pub use diff::{FrameDiffClassifier, FrameDiffSettings};

/// Outcome of classifying one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionReading {
    pub motion_detected: bool,
    pub intensity: f64,
}

impl MotionReading {
    pub fn still() -> Self {
        Self::default()
    }

    pub fn motion(intensity: f64) -> Self {
        Self {
            motion_detected: true,
            intensity,
        }
    }
}

pub trait MotionClassifier: Send {
    /// Classifier identifier for logs.
    fn name(&self) -> &'static str;

    /// Classify a frame. The frame is borrowed for the call only.
    fn detect(&mut self, frame: &Frame) -> MotionReading;

    /// Release classifier resources. Called once when the monitor stops.
    fn close(&mut self) {}
}

/// Builds the classifier for a configured camera.
pub trait ClassifierFactory: Send + Sync {
    fn create(
        &self,
        camera: &CameraConfig,
        motion: &MotionConfig,
    ) -> Result<Box<dyn MotionClassifier>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameDiffFactory;

impl ClassifierFactory for FrameDiffFactory {
    fn create(
        &self,
        camera: &CameraConfig,
        motion: &MotionConfig,
    ) -> Result<Box<dyn MotionClassifier>> {
        Ok(Box::new(FrameDiffClassifier::new(
            &camera.name,
            FrameDiffSettings::from_config(camera, motion),
        )))
    }
}
