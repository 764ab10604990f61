//! Density estimation from particle positions.
//!
//! Two passes per frame:
//! 1. accumulate: zero the grid, then add one unit of mass to the cell each
//!    particle falls in under the current simulation viewport;
//! 2. render: turn cell mass into density `mass / (N * cell_area)` and map it
//!    to colour against the mixture peak.

use crate::error::{Result, check_grid};
use crate::mixture::MixtureOfGaussians;
use crate::render::{Surface, colormap, intensity};
use crate::viewport::{ViewTransform, Viewport};
use glam::Vec2;
use rayon::prelude::*;

/// Particles binned per rayon task before partial histograms are merged
const BIN_CHUNK: usize = 16 * 1024;

/// Fixed-resolution grid of accumulated, unnormalised mass
#[derive(Debug, Clone)]
pub struct DensityAccumulator {
    width: usize,
    height: usize,
    cells: Vec<u32>,
}

impl Default for DensityAccumulator {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            cells: vec![0],
        }
    }
}

impl DensityAccumulator {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        check_grid("accumulator", width, height)?;
        Ok(Self {
            width,
            height,
            cells: vec![0; width * height],
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major cells, row 0 at the bottom (`sim.pmin.y`)
    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    pub fn mass(&self, x: usize, y: usize) -> u32 {
        self.cells[y * self.width + x]
    }

    pub fn total_mass(&self) -> u64 {
        self.cells.iter().map(|&c| c as u64).sum()
    }

    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Change resolution, discarding the contents. Zero sides are ignored.
    pub fn resize(&mut self, width: usize, height: usize) {
        if width == 0 || height == 0 || (width == self.width && height == self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.cells = vec![0; width * height];
    }

    /// Simulation-space area covered by one cell
    pub fn cell_area(&self, sim: &Viewport) -> f32 {
        (sim.width() / self.width as f32) * (sim.height() / self.height as f32)
    }

    /// Index of the cell containing `p`, or `None` when `p` maps outside
    /// the grid.
    #[inline]
    pub fn cell_of(&self, sim: &Viewport, p: Vec2) -> Option<usize> {
        let u = (p - sim.pmin) / sim.size() * Vec2::new(self.width as f32, self.height as f32);
        // negated comparisons also reject NaN
        if !(u.x >= 0.0 && u.y >= 0.0 && u.x < self.width as f32 && u.y < self.height as f32) {
            return None;
        }
        let (ix, iy) = (u.x as usize, u.y as usize);
        Some(iy.min(self.height - 1) * self.width + ix.min(self.width - 1))
    }

    /// Simulation-space centre of cell `(x, y)`
    pub fn cell_center(&self, sim: &Viewport, x: usize, y: usize) -> Vec2 {
        let uv = Vec2::new(
            (x as f32 + 0.5) / self.width as f32,
            (y as f32 + 0.5) / self.height as f32,
        );
        sim.pmin + uv * sim.size()
    }

    /// Zero the grid and bin `particles` under `sim`. Returns how many
    /// particles landed inside.
    pub fn accumulate(&mut self, particles: &[Vec2], sim: &Viewport) -> u64 {
        self.clear();
        let n = self.cells.len();
        let this = &*self;
        let binned = particles
            .par_chunks(BIN_CHUNK)
            .fold(
                || vec![0u32; n],
                |mut hist, chunk| {
                    for &p in chunk {
                        if let Some(i) = this.cell_of(sim, p) {
                            hist[i] += 1;
                        }
                    }
                    hist
                },
            )
            .reduce(
                || vec![0u32; n],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        for (cell, add) in self.cells.iter_mut().zip(binned) {
            *cell += add;
        }
        self.total_mass()
    }
}

/// Comparison of the estimate against the analytic mixture, on the
/// accumulator grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateStats {
    /// Particles that landed inside the viewport
    pub total_mass: u64,
    /// Particles outside the viewport
    pub clipped: u64,
    /// Integrated absolute error over the viewport
    pub l1_error: f32,
    /// Largest per-cell absolute error
    pub max_abs_error: f32,
}

/// Accumulate pass + normalise/render pass
#[derive(Debug, Clone)]
pub struct DensityEstimator {
    accumulator: DensityAccumulator,
    sim: Viewport,
    particle_count: usize,
}

impl DensityEstimator {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Ok(Self {
            accumulator: DensityAccumulator::new(width, height)?,
            sim: Viewport::new(Vec2::splat(-1.0), Vec2::splat(1.0)),
            particle_count: 0,
        })
    }

    pub fn accumulator(&self) -> &DensityAccumulator {
        &self.accumulator
    }

    /// Viewport of the last accumulation
    pub fn viewport(&self) -> &Viewport {
        &self.sim
    }

    /// Rebuild the grid from `particles`. Any previous mass is discarded.
    pub fn accumulate(&mut self, particles: &[Vec2], sim: &Viewport) -> u64 {
        self.sim = *sim;
        self.particle_count = particles.len();
        self.accumulator.accumulate(particles, sim)
    }

    /// Take over a grid accumulated elsewhere, e.g. read back from a device.
    /// `cells` shorter than the grid leaves the remaining cells at zero.
    pub fn load(&mut self, cells: &[u32], sim: &Viewport, particle_count: usize) {
        self.sim = *sim;
        self.particle_count = particle_count;
        self.accumulator.clear();
        for (dst, &src) in self.accumulator.cells.iter_mut().zip(cells) {
            *dst = src;
        }
    }

    /// `mass / (N * cell_area)` of cell `(x, y)`
    pub fn density(&self, x: usize, y: usize) -> f32 {
        self.normalise(self.accumulator.mass(x, y))
    }

    /// Estimated density at simulation point `p`, zero outside the grid
    pub fn density_at(&self, p: Vec2) -> f32 {
        match self.accumulator.cell_of(&self.sim, p) {
            Some(i) => self.normalise(self.accumulator.cells[i]),
            None => 0.0,
        }
    }

    #[inline]
    fn normalise(&self, mass: u32) -> f32 {
        let denom = self.particle_count as f32 * self.accumulator.cell_area(&self.sim);
        if denom > 0.0 { mass as f32 / denom } else { 0.0 }
    }

    /// Draw the normalised estimate into `transform.pixels`, coloured against
    /// `peak`. `transform.sim` should be the viewport last accumulated with.
    pub fn render(&self, transform: &ViewTransform, peak: f32, surface: &mut Surface) {
        surface.fill_region(&transform.pixels, |x, y| {
            let p = transform.sim_at_pixel(x, y);
            colormap(intensity(self.density_at(p), peak))
        });
    }

    pub fn stats(&self, mixture: &MixtureOfGaussians) -> EstimateStats {
        let acc = &self.accumulator;
        let area = acc.cell_area(&self.sim);
        let mut l1 = 0.0f64;
        let mut max_abs = 0.0f32;
        for y in 0..acc.height {
            for x in 0..acc.width {
                let analytic = mixture.evaluate(acc.cell_center(&self.sim, x, y));
                let err = (self.density(x, y) - analytic).abs();
                l1 += err as f64 * area as f64;
                max_abs = max_abs.max(err);
            }
        }
        let total_mass = acc.total_mass();
        EstimateStats {
            total_mass,
            clipped: (self.particle_count as u64).saturating_sub(total_mass),
            l1_error: l1 as f32,
            max_abs_error: max_abs,
        }
    }
}
