//! The frame pipeline behind one interface, so the CPU reference and the
//! compute-shader implementation are interchangeable.

use crate::config::GridSize;
use crate::density::{DensityEstimator, EstimateStats};
use crate::error::Result;
use crate::field::{Integrator, LangevinKernel, ParticleField};
use crate::mixture::MixtureOfGaussians;
use crate::render::{AnalyticRenderer, ParticleRenderer, Surface};
use crate::viewport::{FrameLayout, ViewTransform, Viewport};
use glam::Vec2;

pub trait Backend {
    fn name(&self) -> &'static str;

    fn particle_count(&self) -> usize;

    /// Completed integration steps since construction or the last reset
    fn steps(&self) -> u64;

    /// Replace the backend's copy of the mixture. Call once per frame at most,
    /// before `step`, whenever the mixture changed.
    fn set_mixture(&mut self, mixture: &MixtureOfGaussians) -> Result<()>;

    /// Advance every particle by one Langevin step.
    fn step(&mut self, dt: f32) -> Result<()>;

    /// Accumulate the current particles under `transform.sim` and draw the
    /// normalised estimate into `transform.pixels`.
    fn render_estimate(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()>;

    fn render_analytic(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()>;

    /// Plot the current particles as points.
    fn render_particles(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()>;

    /// Copy of the most recently completed particle buffer
    fn read_particles(&mut self) -> Result<Vec<Vec2>>;

    /// Back to the initial lattice with a new noise seed.
    fn reset_particles(&mut self, seed: u64) -> Result<()>;

    /// Compare the estimate under `sim` against the analytic density.
    fn estimate_stats(&mut self, sim: &Viewport) -> Result<EstimateStats>;

    /// Estimate on the left half, analytic density on the right.
    fn render(&mut self, layout: &FrameLayout, surface: &mut Surface) -> Result<()> {
        self.render_estimate(&layout.estimate, surface)?;
        self.render_analytic(&layout.analytic, surface)
    }
}

/// Reference pipeline on the CPU, data-parallel through rayon
#[derive(Debug, Clone)]
pub struct CpuBackend<I = LangevinKernel> {
    field: ParticleField,
    integrator: I,
    mixture: MixtureOfGaussians,
    estimator: DensityEstimator,
    analytic: AnalyticRenderer,
    particles: ParticleRenderer,
}

impl CpuBackend {
    pub fn new(particles: GridSize, accumulator: GridSize, seed: u64) -> Result<Self> {
        Self::with_integrator(particles, accumulator, seed, LangevinKernel)
    }
}

impl<I: Integrator> CpuBackend<I> {
    pub fn with_integrator(
        particles: GridSize,
        accumulator: GridSize,
        seed: u64,
        integrator: I,
    ) -> Result<Self> {
        let field = ParticleField::new(particles.width, particles.height, seed)?;
        let estimator = DensityEstimator::new(accumulator.width, accumulator.height)?;
        log::info!(
            "cpu backend: {}x{} particles, {}x{} accumulator, {} threads",
            particles.width,
            particles.height,
            accumulator.width,
            accumulator.height,
            rayon::current_num_threads()
        );
        let mixture = MixtureOfGaussians::default();
        Ok(Self {
            field,
            integrator,
            analytic: AnalyticRenderer::new(&mixture),
            mixture,
            estimator,
            particles: ParticleRenderer::default(),
        })
    }

    pub fn field(&self) -> &ParticleField {
        &self.field
    }

    pub fn mixture(&self) -> &MixtureOfGaussians {
        &self.mixture
    }

    pub fn estimator(&self) -> &DensityEstimator {
        &self.estimator
    }
}

impl<I: Integrator> Backend for CpuBackend<I> {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn particle_count(&self) -> usize {
        self.field.len()
    }

    fn steps(&self) -> u64 {
        self.field.steps()
    }

    fn set_mixture(&mut self, mixture: &MixtureOfGaussians) -> Result<()> {
        log::debug!("mixture resynchronised: {} components, peak {}", mixture.count(), mixture.peak());
        self.mixture = mixture.clone();
        self.analytic.set_mixture(mixture);
        Ok(())
    }

    fn step(&mut self, dt: f32) -> Result<()> {
        self.field.step(&self.integrator, &self.mixture, dt);
        Ok(())
    }

    fn render_estimate(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        self.estimator.accumulate(self.field.particles(), &transform.sim);
        self.estimator.render(transform, self.mixture.peak(), surface);
        Ok(())
    }

    fn render_analytic(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        self.analytic.render(transform, surface);
        Ok(())
    }

    fn render_particles(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        self.particles.render(self.field.particles(), transform, surface);
        Ok(())
    }

    fn read_particles(&mut self) -> Result<Vec<Vec2>> {
        Ok(self.field.particles().to_vec())
    }

    fn reset_particles(&mut self, seed: u64) -> Result<()> {
        self.field.reset(seed);
        Ok(())
    }

    fn estimate_stats(&mut self, sim: &Viewport) -> Result<EstimateStats> {
        self.estimator.accumulate(self.field.particles(), sim);
        Ok(self.estimator.stats(&self.mixture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::StepParams;
    use crate::mixture::Gaussian;
    use crate::viewport::ViewState;

    fn small() -> CpuBackend {
        CpuBackend::new(GridSize::new(64, 32), GridSize::new(32, 32), 5).unwrap()
    }

    #[test]
    fn test_zero_accumulator_rejected() {
        assert!(CpuBackend::new(GridSize::new(8, 8), GridSize::new(0, 8), 1).is_err());
    }

    #[test]
    fn test_step_counts() {
        let mut b = small();
        assert_eq!(b.particle_count(), 64 * 32);
        b.step(1e-3).unwrap();
        b.step(1e-3).unwrap();
        assert_eq!(b.steps(), 2);
        b.reset_particles(9).unwrap();
        assert_eq!(b.steps(), 0);
    }

    #[test]
    fn test_set_mixture_drives_drift() {
        let mut b = small();
        let target = Vec2::new(3.0, 0.0);
        b.set_mixture(&MixtureOfGaussians::from_components([Gaussian::new(target, Vec2::splat(0.5))]))
            .unwrap();
        let before = b.read_particles().unwrap();
        for _ in 0..50 {
            b.step(1e-2).unwrap();
        }
        let after = b.read_particles().unwrap();
        let mean = |ps: &[Vec2]| ps.iter().copied().sum::<Vec2>() / ps.len() as f32;
        assert!(mean(&after).x > mean(&before).x + 0.5);
    }

    #[test]
    fn test_render_fills_both_halves() {
        let mut b = small();
        let mut s = Surface::new(64, 32);
        let layout = FrameLayout::split(&ViewState::default(), 64, 32);
        b.render(&layout, &mut s).unwrap();
        let luma = |c: [u8; 4]| c[0] as u32 + c[1] as u32 + c[2] as u32;
        // right half is centred on the mixture mean
        assert!(luma(s.pixel(48, 16)) > luma(s.pixel(33, 1)));
        assert!(s.pixels().iter().all(|p| p[3] == 255));
        assert_eq!(b.estimator().viewport(), &layout.estimate.sim);
    }

    #[test]
    fn test_stats_account_for_every_particle() {
        let mut b = small();
        let stats = b.estimate_stats(&Viewport::new(Vec2::splat(-0.5), Vec2::splat(0.5))).unwrap();
        assert_eq!(stats.total_mass + stats.clipped, (64 * 32) as u64);
        assert!(stats.clipped > 0);
    }

    /// Moves every particle by `dt` along x, no noise
    struct Shift;

    impl Integrator for Shift {
        fn integrate(&self, _: &MixtureOfGaussians, params: &StepParams, current: &[Vec2], next: &mut [Vec2]) {
            for (dst, p) in next.iter_mut().zip(current) {
                *dst = *p + Vec2::new(params.dt(), 0.0);
            }
        }
    }

    #[test]
    fn test_custom_integrator() {
        let mut b = CpuBackend::with_integrator(GridSize::new(2, 2), GridSize::new(4, 4), 0, Shift).unwrap();
        b.step(0.5).unwrap();
        b.step(0.5).unwrap();
        let ps = b.read_particles().unwrap();
        assert_eq!(ps[0], Vec2::new(0.0, -1.0));
    }
}
