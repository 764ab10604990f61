//! Double-buffered particle state and the Langevin step.
//!
//! Two physical buffers alternate between "readable" (the last completed
//! state) and "writable" (the state being produced). The roles are picked
//! by step parity and a step only ever reads one buffer and writes the
//! other.

use crate::error::{Result, check_grid};
use crate::mixture::MixtureOfGaussians;
use crate::noise::ParticleRng;
use glam::Vec2;
use rayon::prelude::*;

/// One of the two physical buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Slot holding the readable state after `step` completed steps
    #[inline]
    pub fn for_step(step: u64) -> Self {
        if step & 1 == 0 { Slot::A } else { Slot::B }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

/// Two slots plus the parity counter that assigns their roles
#[derive(Debug, Clone)]
pub struct PingPong<T> {
    slots: [T; 2],
    step: u64,
}

impl<T> PingPong<T> {
    pub fn new(a: T, b: T) -> Self {
        Self {
            slots: [a, b],
            step: 0,
        }
    }

    /// Completed steps
    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn readable(&self) -> Slot {
        Slot::for_step(self.step)
    }

    pub fn writable(&self) -> Slot {
        self.readable().other()
    }

    /// The last completed state
    pub fn current(&self) -> &T {
        self.get(self.readable())
    }

    pub fn get(&self, slot: Slot) -> &T {
        &self.slots[slot.index()]
    }

    /// Run `f(readable_slot, readable, writable)` then flip roles.
    pub fn advance<R>(&mut self, f: impl FnOnce(Slot, &T, &mut T) -> R) -> R {
        let read = self.readable();
        let [a, b] = &mut self.slots;
        let out = match read {
            Slot::A => f(read, a, b),
            Slot::B => f(read, b, a),
        };
        self.step += 1;
        out
    }

    /// Mutate both slots and restart the parity counter.
    pub fn reset_with(&mut self, mut f: impl FnMut(&mut T)) {
        for slot in &mut self.slots {
            f(slot);
        }
        self.step = 0;
    }
}

/// Per-step inputs of the integration pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    /// Time step; negative or NaN values act as zero
    pub dt: f32,
    pub seed: u64,
    /// Index of the step being produced
    pub step: u64,
}

impl StepParams {
    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt.max(0.0)
    }
}

/// The particle integration pass.
///
/// Reads every position from `current` and writes the advanced position at
/// the same index of `next`. Implementations must not couple particles.
pub trait Integrator {
    fn integrate(
        &self,
        mixture: &MixtureOfGaussians,
        params: &StepParams,
        current: &[Vec2],
        next: &mut [Vec2],
    );
}

/// Overdamped Langevin update for a single particle:
/// `p + dt * grad(ln p) + sqrt(2 dt) * xi`
#[inline]
pub fn langevin_update(mixture: &MixtureOfGaussians, p: Vec2, dt: f32, xi: Vec2) -> Vec2 {
    p + dt * mixture.grad_log_density(p) + (2.0 * dt).sqrt() * xi
}

/// CPU integrator, one rayon task per particle
#[derive(Debug, Clone, Copy, Default)]
pub struct LangevinKernel;

impl Integrator for LangevinKernel {
    fn integrate(
        &self,
        mixture: &MixtureOfGaussians,
        params: &StepParams,
        current: &[Vec2],
        next: &mut [Vec2],
    ) {
        let dt = params.dt();
        next.par_iter_mut()
            .zip(current.par_iter())
            .enumerate()
            .for_each(|(i, (dst, &p))| {
                let xi = ParticleRng::new(params.seed, params.step, i as u64).standard_normal2();
                *dst = langevin_update(mixture, p, dt, xi);
            });
    }
}

/// Uniform `width x height` lattice over `[-1, 1]^2`
pub fn initial_grid(width: usize, height: usize) -> Vec<Vec2> {
    let axis = |i: usize, n: usize| {
        if n > 1 {
            2.0 * (i as f32 / (n as f32 - 1.0)) - 1.0
        } else {
            0.0
        }
    };
    let mut particles = Vec::with_capacity(width * height);
    for i in 0..width {
        let x = axis(i, width);
        for j in 0..height {
            particles.push(Vec2::new(x, axis(j, height)));
        }
    }
    particles
}

/// `width x height` independent particles in two alternating buffers
#[derive(Debug, Clone)]
pub struct ParticleField {
    width: usize,
    height: usize,
    seed: u64,
    buffers: PingPong<Vec<Vec2>>,
}

impl ParticleField {
    pub fn new(width: usize, height: usize, seed: u64) -> Result<Self> {
        check_grid("particle", width, height)?;
        let particles = initial_grid(width, height);
        Ok(Self {
            width,
            height,
            seed,
            buffers: PingPong::new(particles.clone(), particles),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn steps(&self) -> u64 {
        self.buffers.steps()
    }

    /// Slot holding [`particles`](Self::particles)
    pub fn readable_slot(&self) -> Slot {
        self.buffers.readable()
    }

    /// Slot the next step will write
    pub fn writable_slot(&self) -> Slot {
        self.buffers.writable()
    }

    /// The most recently completed positions
    pub fn particles(&self) -> &[Vec2] {
        self.buffers.current()
    }

    pub fn slot(&self, slot: Slot) -> &[Vec2] {
        self.buffers.get(slot)
    }

    /// Advance every particle by one step of `integrator`.
    pub fn step<I: Integrator + ?Sized>(
        &mut self,
        integrator: &I,
        mixture: &MixtureOfGaussians,
        dt: f32,
    ) {
        let params = StepParams {
            dt,
            seed: self.seed,
            step: self.buffers.steps(),
        };
        self.buffers.advance(|_, current, next| {
            integrator.integrate(mixture, &params, current, next);
        });
    }

    /// Back to the initial lattice with a fresh noise seed.
    pub fn reset(&mut self, seed: u64) {
        let grid = initial_grid(self.width, self.height);
        self.buffers.reset_with(|slot| slot.copy_from_slice(&grid));
        self.seed = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::Gaussian;

    fn narrow() -> MixtureOfGaussians {
        MixtureOfGaussians::from_components([Gaussian::new(Vec2::ZERO, Vec2::splat(0.1))])
    }

    #[test]
    fn test_slot_other() {
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.other(), Slot::A);
        assert_eq!(Slot::for_step(0), Slot::A);
        assert_eq!(Slot::for_step(7), Slot::B);
    }

    #[test]
    fn test_initial_grid_spans_unit_square() {
        let grid = initial_grid(5, 3);
        assert_eq!(grid.len(), 15);
        assert_eq!(grid[0], Vec2::new(-1.0, -1.0));
        assert_eq!(grid[2], Vec2::new(-1.0, 1.0));
        assert_eq!(grid[14], Vec2::new(1.0, 1.0));
        assert_eq!(grid[7], Vec2::new(0.0, 0.0));
    }

    #[test]
    fn test_degenerate_axis() {
        let grid = initial_grid(1, 2);
        assert_eq!(grid, vec![Vec2::new(0.0, -1.0), Vec2::new(0.0, 1.0)]);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(ParticleField::new(0, 4, 1).is_err());
    }

    #[test]
    fn test_step_leaves_previous_buffer_untouched() {
        let mut field = ParticleField::new(32, 16, 5).unwrap();
        let m = narrow();
        field.step(&LangevinKernel, &m, 1e-3);

        let read_slot = field.readable_slot();
        let before = field.particles().to_vec();
        field.step(&LangevinKernel, &m, 1e-3);

        // the buffer that was readable is now the write target of the *next*
        // step, but this step must not have touched it
        assert_eq!(field.slot(read_slot), &before[..]);
        assert_ne!(field.particles(), &before[..]);
        assert_eq!(field.readable_slot(), read_slot.other());
    }

    #[test]
    fn test_particles_never_writable_slot() {
        let mut field = ParticleField::new(4, 4, 1).unwrap();
        let m = narrow();
        for _ in 0..5 {
            assert_ne!(field.readable_slot(), field.writable_slot());
            assert!(std::ptr::eq(
                field.particles().as_ptr(),
                field.slot(field.readable_slot()).as_ptr()
            ));
            field.step(&LangevinKernel, &m, 1e-3);
        }
        assert_eq!(field.steps(), 5);
    }

    #[test]
    fn test_advance_reads_one_writes_other() {
        let mut pp = PingPong::new(vec![1], vec![2]);
        pp.advance(|slot, src, dst| {
            assert_eq!(slot, Slot::A);
            dst[0] = src[0] * 10;
        });
        assert_eq!(pp.current(), &vec![10]);
        assert_eq!(pp.get(Slot::A), &vec![1]);
        pp.advance(|slot, src, dst| {
            assert_eq!(slot, Slot::B);
            dst[0] = src[0] + 1;
        });
        assert_eq!(pp.current(), &vec![11]);
        assert_eq!(pp.get(Slot::B), &vec![10]);
    }

    #[test]
    fn test_zero_dt_is_identity() {
        let mut field = ParticleField::new(40, 20, 99).unwrap();
        let start = field.particles().to_vec();
        let m = narrow();
        for _ in 0..6 {
            field.step(&LangevinKernel, &m, 0.0);
        }
        assert_eq!(field.particles(), &start[..]);
    }

    #[test]
    fn test_negative_dt_treated_as_zero() {
        let mut field = ParticleField::new(8, 8, 3).unwrap();
        let start = field.particles().to_vec();
        field.step(&LangevinKernel, &narrow(), -1.0);
        assert_eq!(field.particles(), &start[..]);
    }

    #[test]
    fn test_step_is_deterministic() {
        let m = narrow();
        let mut a = ParticleField::new(16, 16, 1234).unwrap();
        let mut b = ParticleField::new(16, 16, 1234).unwrap();
        for _ in 0..3 {
            a.step(&LangevinKernel, &m, 1e-3);
            b.step(&LangevinKernel, &m, 1e-3);
        }
        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn test_drift_contracts_toward_mode() {
        let m = narrow();
        let mut field = ParticleField::new(30, 30, 8).unwrap();
        let spread = |ps: &[Vec2]| ps.iter().map(|p| p.length_squared()).sum::<f32>() / ps.len() as f32;
        let before = spread(field.particles());
        for _ in 0..400 {
            field.step(&LangevinKernel, &m, 1e-3);
        }
        let after = spread(field.particles());
        // stationary second moment is 2 * sigma^2 = 0.02
        assert!(after < before * 0.2, "before {before}, after {after}");
        assert!((after - 0.02).abs() < 0.01, "after {after}");
    }

    #[test]
    fn test_reset_restores_grid() {
        let mut field = ParticleField::new(6, 6, 1).unwrap();
        field.step(&LangevinKernel, &narrow(), 1e-2);
        field.reset(2);
        assert_eq!(field.steps(), 0);
        assert_eq!(field.seed(), 2);
        assert_eq!(field.particles(), &initial_grid(6, 6)[..]);
        assert_eq!(field.slot(Slot::B), &initial_grid(6, 6)[..]);
    }
}
