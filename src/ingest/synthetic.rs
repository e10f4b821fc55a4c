//! Synthetic frame source (`stub://` URLs).
//!
//! Renders a static gray background with a bright block that periodically
//! sweeps across the scene. Query parameters tune the scene:
//! `stub://porch?width=320&height=240&motion_every=90&motion_frames=30`.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use url::Url;

use super::{FrameSource, StreamInfo};
use crate::frame::{Frame, BYTES_PER_PIXEL};

const BACKGROUND: u8 = 96;
const BLOCK: u8 = 240;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// A motion burst starts every `motion_every` frames (0 disables motion).
    pub motion_every: u64,
    /// Length of each motion burst in frames.
    pub motion_frames: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 30.0,
            motion_every: 150,
            motion_frames: 30,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(raw: &str, fps: f64) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parse stub url {}", raw))?;
        let mut cfg = Self {
            fps,
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => cfg.width = parse_param(&key, &value)?,
                "height" => cfg.height = parse_param(&key, &value)?,
                "motion_every" => cfg.motion_every = parse_param(&key, &value)?,
                "motion_frames" => cfg.motion_frames = parse_param(&key, &value)?,
                other => log::warn!("stub url {}: ignoring unknown parameter '{}'", raw, other),
            }
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(anyhow!("stub url {}: width and height must be > 0", raw));
        }
        Ok(cfg)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' has invalid value '{}'", key, value))
}

pub struct SyntheticSource {
    camera: Arc<str>,
    config: SyntheticConfig,
    open: bool,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(camera: &str, config: SyntheticConfig) -> Self {
        Self {
            camera: Arc::from(camera),
            config,
            open: false,
            frame_count: 0,
        }
    }

    /// Whether frame number `n` falls inside a motion burst.
    fn in_burst(&self, n: u64) -> bool {
        let every = self.config.motion_every;
        every > 0 && n % every >= every.saturating_sub(self.config.motion_frames)
    }

    fn render(&self, n: u64) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![BACKGROUND; w * h * BYTES_PER_PIXEL];
        if !self.in_burst(n) {
            return pixels;
        }
        let side = (w.min(h) / 3).max(1);
        let span = w.saturating_sub(side).max(1);
        let x0 = (n as usize * 7) % span;
        let y0 = h.saturating_sub(side) / 2;
        for y in y0..(y0 + side).min(h) {
            let row = y * w * BYTES_PER_PIXEL;
            for x in x0..(x0 + side).min(w) {
                let px = row + x * BYTES_PER_PIXEL;
                pixels[px..px + BYTES_PER_PIXEL].fill(BLOCK);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("[{}] synthetic source opened", self.camera);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("stream not open"));
        }
        self.frame_count += 1;
        let pixels = self.render(self.frame_count);
        Ok(Frame::new(
            Arc::clone(&self.camera),
            pixels,
            self.config.width,
            self.config.height,
        ))
    }

    fn close(&mut self) {
        if self.open {
            log::info!(
                "[{}] synthetic source closed after {} frames",
                self.camera,
                self.frame_count
            );
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn info(&self) -> StreamInfo {
        if !self.open {
            return StreamInfo::default();
        }
        StreamInfo::new(
            self.config.width,
            self.config.height,
            self.config.fps,
            "RAW-RGB",
        )
    }
}
