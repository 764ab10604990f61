//! Startup configuration, loaded from and saved to JSON.

use crate::error::{Result, check_grid};
use crate::mixture::{Gaussian, MAX_COMPONENTS, MixtureOfGaussians};
use crate::noise::random_seed;
use crate::viewport::{SCALE_MAX, SCALE_MIN, ViewState};
use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Range the time step may be adjusted within
pub const DT_MIN: f32 = 1e-6;
pub const DT_MAX: f32 = 1e-2;

/// Largest window edge, in pixels
pub const WINDOW_MAX: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: usize,
    pub height: usize,
}

impl GridSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width and height as pixel extents, saturating at `u32::MAX`
    pub fn extent(&self) -> (u32, u32) {
        let clamp = |v: usize| u32::try_from(v).unwrap_or(u32::MAX);
        (clamp(self.width), clamp(self.height))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub particles: GridSize,
    pub accumulator: GridSize,
    pub dt: f32,
    pub view: ViewState,
    pub mixture: Vec<Gaussian>,
    /// Noise seed; drawn from OS entropy when absent
    pub seed: Option<u64>,
    pub window: GridSize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            particles: GridSize::new(1920, 200),
            accumulator: GridSize::new(200, 200),
            dt: 4e-5,
            view: ViewState::default(),
            mixture: vec![
                Gaussian::new(Vec2::new(-0.5, -0.5), Vec2::splat(0.1)),
                Gaussian::new(Vec2::new(0.5, 0.5), Vec2::splat(0.1)),
                Gaussian::new(Vec2::new(-0.5, 0.5), Vec2::splat(0.1)),
                Gaussian::new(Vec2::new(0.5, -0.5), Vec2::splat(0.1)),
            ],
            seed: None,
            window: GridSize::new(1280, 800),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&json)?;
        log::info!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp out-of-range values in place. Zero-sized grids cannot be fixed
    /// up and are rejected.
    pub fn validate(&mut self) -> Result<()> {
        check_grid("particle", self.particles.width, self.particles.height)?;
        check_grid("accumulator", self.accumulator.width, self.accumulator.height)?;

        let dt = if self.dt.is_nan() { DT_MIN } else { self.dt.clamp(DT_MIN, DT_MAX) };
        if dt != self.dt {
            log::warn!("dt {} outside [{DT_MIN}, {DT_MAX}], using {dt}", self.dt);
            self.dt = dt;
        }

        let scale = if self.view.scale.is_nan() { 1.0 } else { self.view.scale.clamp(SCALE_MIN, SCALE_MAX) };
        if scale != self.view.scale {
            log::warn!("view scale {} outside [{SCALE_MIN}, {SCALE_MAX}], using {scale}", self.view.scale);
            self.view.scale = scale;
        }
        if !self.view.center.is_finite() {
            log::warn!("view center {} is not finite, recentering", self.view.center);
            self.view.center = Vec2::ZERO;
        }

        if self.mixture.len() > MAX_COMPONENTS {
            log::warn!(
                "{} mixture components configured, keeping the first {MAX_COMPONENTS}",
                self.mixture.len()
            );
            self.mixture.truncate(MAX_COMPONENTS);
        }
        if self.mixture.is_empty() {
            log::warn!("no mixture components configured, using one default component");
            self.mixture.push(Gaussian::default());
        }

        if self.window.is_empty() {
            log::warn!("window size {}x{} is empty, using 1280x800", self.window.width, self.window.height);
            self.window = GridSize::new(1280, 800);
        }
        if self.window.width > WINDOW_MAX || self.window.height > WINDOW_MAX {
            let window = GridSize::new(self.window.width.min(WINDOW_MAX), self.window.height.min(WINDOW_MAX));
            log::warn!(
                "window size {}x{} too large, using {}x{}",
                self.window.width,
                self.window.height,
                window.width,
                window.height
            );
            self.window = window;
        }
        Ok(())
    }

    pub fn build_mixture(&self) -> MixtureOfGaussians {
        MixtureOfGaussians::from_components(self.mixture.iter().copied())
    }

    /// The configured seed, or a fresh one from OS entropy
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(random_seed)
    }
}
