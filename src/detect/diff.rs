use std::time::{Duration, Instant};

use super::{MotionClassifier, MotionReading};
use crate::config::{CameraConfig, MotionConfig};
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Tuning for `FrameDiffClassifier`.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameDiffSettings {
    /// Total moving area (full-resolution pixels) that counts as motion.
    pub threshold: f64,
    /// Moving regions smaller than this many pixels are ignored as noise.
    pub min_area: u32,
    /// Luma difference from the background that marks a cell as changed.
    pub pixel_delta: u8,
    /// Minimum time between two evaluations.
    pub interval: Duration,
    /// Sampling step in pixels along both axes.
    pub scale: usize,
    /// Background adaptation rate per evaluated frame.
    pub learning_rate: f32,
}

impl Default for FrameDiffSettings {
    fn default() -> Self {
        Self {
            threshold: 5000.0,
            min_area: 500,
            pixel_delta: 25,
            interval: Duration::from_millis(500),
            scale: 4,
            learning_rate: 0.05,
        }
    }
}

impl FrameDiffSettings {
    pub fn from_config(camera: &CameraConfig, motion: &MotionConfig) -> Self {
        Self {
            threshold: camera.motion_threshold,
            min_area: motion.min_area,
            pixel_delta: motion.pixel_delta,
            interval: Duration::from_millis(motion.detection_interval_ms),
            ..Self::default()
        }
    }
}

/// Background-subtraction classifier over a subsampled luma plane.
///
/// Each evaluated frame is compared against a running-average background;
/// changed cells are grouped into 8-connected regions and regions above
/// `min_area` are summed. Motion is reported when the sum exceeds
/// `threshold`, with the sum as intensity.
pub struct FrameDiffClassifier {
    camera: String,
    settings: FrameDiffSettings,
    background: Option<Background>,
    last_evaluated: Option<Instant>,
}

struct Background {
    cols: usize,
    rows: usize,
    luma: Vec<f32>,
}

impl FrameDiffClassifier {
    pub fn new(camera: &str, settings: FrameDiffSettings) -> Self {
        Self {
            camera: camera.to_string(),
            settings,
            background: None,
            last_evaluated: None,
        }
    }

    fn sample_luma(&self, frame: &Frame) -> (usize, usize, Vec<f32>) {
        let scale = self.settings.scale.max(1);
        let (w, h) = (frame.width as usize, frame.height as usize);
        let cols = w.div_ceil(scale);
        let rows = h.div_ceil(scale);
        let pixels = frame.pixels();
        let mut luma = Vec::with_capacity(cols * rows);
        for y in (0..h).step_by(scale) {
            for x in (0..w).step_by(scale) {
                let i = (y * w + x) * BYTES_PER_PIXEL;
                let (r, g, b) = (pixels[i] as f32, pixels[i + 1] as f32, pixels[i + 2] as f32);
                luma.push(0.299 * r + 0.587 * g + 0.114 * b);
            }
        }
        (cols, rows, luma)
    }

    /// Sum of moving region areas in full-resolution pixels.
    fn moving_area(&self, changed: &[bool], cols: usize, rows: usize) -> u64 {
        let cell_area = (self.settings.scale.max(1) * self.settings.scale.max(1)) as u64;
        let mut seen = vec![false; changed.len()];
        let mut stack = Vec::new();
        let mut total = 0u64;
        for start in 0..changed.len() {
            if !changed[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            stack.push(start);
            let mut cells = 0u64;
            while let Some(idx) = stack.pop() {
                cells += 1;
                let (cx, cy) = ((idx % cols) as isize, (idx / cols) as isize);
                for dy in -1..=1isize {
                    for dx in -1..=1isize {
                        let (nx, ny) = (cx + dx, cy + dy);
                        if nx < 0 || ny < 0 || nx >= cols as isize || ny >= rows as isize {
                            continue;
                        }
                        let n = ny as usize * cols + nx as usize;
                        if changed[n] && !seen[n] {
                            seen[n] = true;
                            stack.push(n);
                        }
                    }
                }
            }
            let area = cells * cell_area;
            if area > self.settings.min_area as u64 {
                total += area;
            }
        }
        total
    }
}

impl MotionClassifier for FrameDiffClassifier {
    fn name(&self) -> &'static str {
        "frame-diff"
    }

    fn detect(&mut self, frame: &Frame) -> MotionReading {
        let now = Instant::now();
        if let Some(last) = self.last_evaluated {
            if now.duration_since(last) < self.settings.interval {
                return MotionReading::still();
            }
        }
        if !frame.is_well_formed() {
            return MotionReading::still();
        }
        self.last_evaluated = Some(now);

        let (cols, rows, luma) = self.sample_luma(frame);
        let fits = matches!(&self.background, Some(bg) if bg.cols == cols && bg.rows == rows);
        if !fits {
            self.background = Some(Background { cols, rows, luma });
            return MotionReading::still();
        }
        let Some(background) = self.background.as_mut() else {
            return MotionReading::still();
        };

        let delta = self.settings.pixel_delta as f32;
        let rate = self.settings.learning_rate;
        let changed: Vec<bool> = background
            .luma
            .iter_mut()
            .zip(&luma)
            .map(|(bg, &current)| {
                let moved = (current - *bg).abs() > delta;
                *bg += (current - *bg) * rate;
                moved
            })
            .collect();

        let area = self.moving_area(&changed, cols, rows) as f64;
        if area > self.settings.threshold {
            log::debug!("[{}] motion detected, area {} px", self.camera, area);
            MotionReading::motion(area)
        } else {
            MotionReading {
                motion_detected: false,
                intensity: area,
            }
        }
    }

    fn close(&mut self) {
        self.background = None;
    }
}
