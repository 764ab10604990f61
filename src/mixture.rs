//! Mixture of axis-aligned 2D Gaussians
//!
//! The mixture is the potential the particles move in and the reference
//! density both renderers are compared against. Every component carries
//! weight `1/count`.
//!
//! `peak` is cached and recomputed by every mutating method, so a consumer
//! holding a `&MixtureOfGaussians` always sees a peak that matches the
//! active components.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Fixed capacity of the mixture
pub const MAX_COMPONENTS: usize = 10;

/// Smallest allowed standard deviation on either axis
pub const SIGMA_FLOOR: f32 = 1e-3;

const TWO_PI: f32 = 6.283185307179586;

/// Axis-aligned anisotropic normal distribution (diagonal covariance)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "GaussianDef", into = "GaussianDef")]
pub struct Gaussian {
    mean: Vec2,
    sigma: Vec2,
}

impl Default for Gaussian {
    fn default() -> Self {
        Self {
            mean: Vec2::ZERO,
            sigma: Vec2::splat(0.1),
        }
    }
}

impl Gaussian {
    /// Create a component; `sigma` is clamped to [`SIGMA_FLOOR`] per axis.
    pub fn new(mean: Vec2, sigma: Vec2) -> Self {
        Self {
            mean,
            sigma: clamp_sigma(sigma),
        }
    }

    pub fn mean(&self) -> Vec2 {
        self.mean
    }

    pub fn sigma(&self) -> Vec2 {
        self.sigma
    }

    /// Probability density at `p`
    #[inline]
    pub fn evaluate(&self, p: Vec2) -> f32 {
        let d = p - self.mean;
        let q = ((d * d) / (self.sigma * self.sigma)).element_sum();
        let denom = TWO_PI * self.sigma.x * self.sigma.y;
        (-0.5 * q).exp() / denom
    }

    /// Natural log of the density, finite everywhere
    #[inline]
    pub fn log_density(&self, p: Vec2) -> f32 {
        let d = (p - self.mean) / self.sigma;
        -0.5 * d.length_squared() - (TWO_PI * self.sigma.x * self.sigma.y).ln()
    }

    /// Gradient of `log_density` at `p`
    #[inline]
    pub fn grad_log_density(&self, p: Vec2) -> Vec2 {
        -(p - self.mean) / (self.sigma * self.sigma)
    }
}

/// Clamp both axes to [`SIGMA_FLOOR`]; NaN maps to the floor as well.
#[inline]
pub fn clamp_sigma(sigma: Vec2) -> Vec2 {
    Vec2::new(sigma.x.max(SIGMA_FLOOR), sigma.y.max(SIGMA_FLOOR))
}

#[derive(Serialize, Deserialize)]
struct GaussianDef {
    mean: [f32; 2],
    sigma: [f32; 2],
}

impl From<GaussianDef> for Gaussian {
    fn from(def: GaussianDef) -> Self {
        Gaussian::new(Vec2::from(def.mean), Vec2::from(def.sigma))
    }
}

impl From<Gaussian> for GaussianDef {
    fn from(g: Gaussian) -> Self {
        GaussianDef {
            mean: g.mean.to_array(),
            sigma: g.sigma.to_array(),
        }
    }
}

/// Equal-weight mixture of up to [`MAX_COMPONENTS`] Gaussians.
///
/// Storage is a fixed array whose tail slots are always initialised; only
/// `components[..count]` take part in evaluation. Shrinking `count` keeps the
/// tail so growing it again restores the previous components.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureOfGaussians {
    components: [Gaussian; MAX_COMPONENTS],
    count: usize,
    peak: f32,
}

impl Default for MixtureOfGaussians {
    fn default() -> Self {
        Self::from_components([Gaussian::default()])
    }
}

impl MixtureOfGaussians {
    /// Build from up to [`MAX_COMPONENTS`] components. Extra components are
    /// dropped; an empty input yields one default component.
    pub fn from_components(components: impl IntoIterator<Item = Gaussian>) -> Self {
        let mut slots = [Gaussian::default(); MAX_COMPONENTS];
        let mut count = 0;
        for g in components.into_iter().take(MAX_COMPONENTS) {
            slots[count] = g;
            count += 1;
        }
        let mut mixture = Self {
            components: slots,
            count: count.max(1),
            peak: 0.0,
        };
        mixture.update_peak();
        mixture
    }

    /// Active component count, always in `1..=MAX_COMPONENTS`
    pub fn count(&self) -> usize {
        self.count
    }

    /// Cached maximum of the mixture over the component means
    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn components(&self) -> &[Gaussian] {
        &self.components[..self.count]
    }

    pub fn component(&self, index: usize) -> Option<&Gaussian> {
        self.components().get(index)
    }

    /// Mixture density at `p`
    pub fn evaluate(&self, p: Vec2) -> f32 {
        let sum: f32 = self.components().iter().map(|g| g.evaluate(p)).sum();
        sum / self.count as f32
    }

    /// Gradient of `ln p(x)`, the Langevin drift.
    ///
    /// Component weights are normalised against the largest log-density so the
    /// result stays finite where every component underflows.
    pub fn grad_log_density(&self, p: Vec2) -> Vec2 {
        let active = self.components();
        let max_log = active
            .iter()
            .map(|g| g.log_density(p))
            .fold(f32::NEG_INFINITY, f32::max);

        let mut weight_sum = 0.0;
        let mut grad = Vec2::ZERO;
        for g in active {
            let w = (g.log_density(p) - max_log).exp();
            weight_sum += w;
            grad += w * g.grad_log_density(p);
        }
        grad / weight_sum
    }

    /// Recompute `peak` as the maximum of the mixture evaluated at each
    /// active mean. This is not the true supremum when components overlap.
    pub fn update_peak(&mut self) {
        debug_assert!(self.count >= 1);
        self.peak = self
            .components()
            .iter()
            .map(|g| self.evaluate(g.mean))
            .fold(0.0, f32::max);
    }

    /// Set the active count, clamped to `1..=MAX_COMPONENTS`
    pub fn set_count(&mut self, count: usize) {
        self.count = count.clamp(1, MAX_COMPONENTS);
        self.update_peak();
    }

    /// Returns `false` when `index` is not an active component.
    pub fn set_mean(&mut self, index: usize, mean: Vec2) -> bool {
        if index >= self.count {
            return false;
        }
        self.components[index].mean = mean;
        self.update_peak();
        true
    }

    /// Sigma is clamped to [`SIGMA_FLOOR`]. Returns `false` when `index` is
    /// not an active component.
    pub fn set_sigma(&mut self, index: usize, sigma: Vec2) -> bool {
        if index >= self.count {
            return false;
        }
        self.components[index].sigma = clamp_sigma(sigma);
        self.update_peak();
        true
    }

    /// Append a component; hands it back when the mixture is full.
    pub fn push(&mut self, g: Gaussian) -> Result<(), Gaussian> {
        self.insert(self.count, g)
    }

    /// Insert at `index` (clamped to `count`), shifting later components.
    pub fn insert(&mut self, index: usize, g: Gaussian) -> Result<(), Gaussian> {
        if self.count == MAX_COMPONENTS {
            return Err(g);
        }
        let index = index.min(self.count);
        self.components.copy_within(index..self.count, index + 1);
        self.components[index] = g;
        self.count += 1;
        self.update_peak();
        Ok(())
    }

    /// Remove the component at `index`. The last remaining component cannot
    /// be removed.
    pub fn remove(&mut self, index: usize) -> Option<Gaussian> {
        if index >= self.count || self.count == 1 {
            return None;
        }
        let removed = self.components[index];
        self.components.copy_within(index + 1..self.count, index);
        self.count -= 1;
        self.components[self.count] = Gaussian::default();
        self.update_peak();
        Some(removed)
    }

    /// Snapshot in the layout the kernels read
    pub fn to_gpu(&self) -> GpuMixture {
        let mut components = [GpuGaussian::zeroed(); MAX_COMPONENTS];
        for (dst, g) in components.iter_mut().zip(self.components()) {
            *dst = GpuGaussian {
                mean: g.mean.to_array(),
                sigma: g.sigma.to_array(),
            };
        }
        GpuMixture {
            count: self.count as u32,
            peak: self.peak,
            _pad: [0; 2],
            components,
        }
    }
}

/// Matches `struct Gaussian` in the kernels (16-byte stride)
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuGaussian {
    pub mean: [f32; 2],
    pub sigma: [f32; 2],
}

/// Matches `struct Mixture` in the kernels (uniform layout, 176 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuMixture {
    pub count: u32,
    pub peak: f32,
    pub _pad: [u32; 2],
    pub components: [GpuGaussian; MAX_COMPONENTS],
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn four_corners() -> MixtureOfGaussians {
        MixtureOfGaussians::from_components([
            Gaussian::new(Vec2::new(-0.5, -0.5), Vec2::splat(0.1)),
            Gaussian::new(Vec2::new(0.5, 0.5), Vec2::splat(0.1)),
            Gaussian::new(Vec2::new(-0.5, 0.5), Vec2::splat(0.1)),
            Gaussian::new(Vec2::new(0.5, -0.5), Vec2::splat(0.1)),
        ])
    }

    #[test]
    fn test_single_component_peak() {
        for s in [0.05f32, 0.1, 0.5, 2.0] {
            let m = MixtureOfGaussians::from_components([Gaussian::new(Vec2::ZERO, Vec2::splat(s))]);
            let expected = 1.0 / (TWO_PI * s * s);
            assert_relative_eq!(m.evaluate(Vec2::ZERO), expected, max_relative = 1e-5);
            assert_relative_eq!(m.peak(), expected, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_anisotropic_form() {
        let g = Gaussian::new(Vec2::new(0.2, -0.1), Vec2::new(0.3, 0.05));
        let p = Vec2::new(0.5, 0.0);
        let dx = (p.x - 0.2) / 0.3;
        let dy = (p.y + 0.1) / 0.05;
        let expected = (-0.5 * (dx * dx + dy * dy)).exp() / (TWO_PI * 0.3 * 0.05);
        assert_relative_eq!(g.evaluate(p), expected, max_relative = 1e-5);
        assert_relative_eq!(g.log_density(p), expected.ln(), max_relative = 1e-4);
    }

    #[test]
    fn test_density_non_negative() {
        let m = four_corners();
        for i in -40..=40 {
            for j in -40..=40 {
                let p = Vec2::new(i as f32 * 0.25, j as f32 * 0.25);
                let v = m.evaluate(p);
                assert!(v >= 0.0 && v.is_finite(), "density {v} at {p}");
            }
        }
    }

    #[test]
    fn test_single_component_integrates_to_one() {
        let m = MixtureOfGaussians::from_components([Gaussian::new(
            Vec2::new(0.1, -0.2),
            Vec2::new(0.2, 0.1),
        )]);
        let n = 400;
        let (lo, hi) = (-2.0f64, 2.0f64);
        let h = (hi - lo) / n as f64;
        let mut total = 0.0f64;
        for i in 0..n {
            for j in 0..n {
                let x = lo + (i as f64 + 0.5) * h;
                let y = lo + (j as f64 + 0.5) * h;
                total += m.evaluate(Vec2::new(x as f32, y as f32)) as f64 * h * h;
            }
        }
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_update_peak_idempotent() {
        let mut m = four_corners();
        m.update_peak();
        let first = m.peak();
        m.update_peak();
        assert_eq!(first, m.peak());
    }

    #[test]
    fn test_peak_follows_mutation() {
        let mut m = four_corners();
        let before = m.peak();
        assert!(m.set_sigma(0, Vec2::splat(0.05)));
        assert!(m.peak() > before);

        let mut fresh = m.clone();
        fresh.update_peak();
        assert_eq!(fresh.peak(), m.peak());
    }

    #[test]
    fn test_sigma_clamped_to_floor() {
        let mut m = four_corners();
        assert!(m.set_sigma(1, Vec2::ZERO));
        assert_eq!(m.components()[1].sigma(), Vec2::splat(SIGMA_FLOOR));

        m.set_sigma(2, Vec2::new(-3.0, f32::NAN));
        assert_eq!(m.components()[2].sigma(), Vec2::splat(SIGMA_FLOOR));
        assert!(m.peak().is_finite());

        let g = Gaussian::new(Vec2::ZERO, Vec2::new(0.0, 0.2));
        assert_eq!(g.sigma(), Vec2::new(SIGMA_FLOOR, 0.2));
    }

    #[test]
    fn test_count_clamped() {
        let mut m = four_corners();
        m.set_count(0);
        assert_eq!(m.count(), 1);
        m.set_count(99);
        assert_eq!(m.count(), MAX_COMPONENTS);
        assert_eq!(m.components().len(), MAX_COMPONENTS);
    }

    #[test]
    fn test_shrink_and_grow_restores_tail() {
        let mut m = four_corners();
        let third = m.components()[2];
        m.set_count(2);
        assert_eq!(m.components().len(), 2);
        m.set_count(4);
        assert_eq!(m.components()[2], third);
    }

    #[test]
    fn test_inactive_components_ignored() {
        let mut m = four_corners();
        m.set_count(1);
        let single = MixtureOfGaussians::from_components([m.components()[0]]);
        let p = Vec2::new(0.5, 0.5);
        assert_eq!(m.evaluate(p), single.evaluate(p));
        assert_eq!(m.peak(), single.peak());
        assert!(!m.set_mean(3, Vec2::ZERO));
    }

    #[test]
    fn test_push_insert_remove() {
        let mut m = MixtureOfGaussians::default();
        for i in 1..MAX_COMPONENTS {
            assert!(m.push(Gaussian::new(Vec2::splat(i as f32), Vec2::ONE)).is_ok());
        }
        assert_eq!(m.count(), MAX_COMPONENTS);
        assert!(m.push(Gaussian::default()).is_err());

        let removed = m.remove(1).unwrap();
        assert_eq!(removed.mean(), Vec2::splat(1.0));
        assert_eq!(m.count(), MAX_COMPONENTS - 1);
        assert_eq!(m.components()[1].mean(), Vec2::splat(2.0));

        let marker = Gaussian::new(Vec2::new(-7.0, 7.0), Vec2::ONE);
        m.insert(0, marker).unwrap();
        assert_eq!(m.components()[0], marker);
        assert_eq!(m.components()[2].mean(), Vec2::splat(2.0));
    }

    #[test]
    fn test_cannot_remove_last() {
        let mut m = MixtureOfGaussians::default();
        assert!(m.remove(0).is_none());
        assert_eq!(m.count(), 1);
    }

    #[test]
    fn test_empty_input_gets_default() {
        let m = MixtureOfGaussians::from_components(std::iter::empty());
        assert_eq!(m.count(), 1);
        assert!(m.peak() > 0.0);
    }

    #[test]
    fn test_grad_points_toward_mean() {
        let m = MixtureOfGaussians::from_components([Gaussian::new(
            Vec2::new(0.3, -0.2),
            Vec2::splat(0.1),
        )]);
        let g = m.grad_log_density(Vec2::new(0.5, -0.2));
        assert!(g.x < 0.0);
        assert_abs_diff_eq!(g.y, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(m.grad_log_density(Vec2::new(0.3, -0.2)).length(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_grad_finite_far_away() {
        let m = four_corners();
        let far = Vec2::new(250.0, -400.0);
        assert_eq!(m.evaluate(far), 0.0);
        let g = m.grad_log_density(far);
        assert!(g.is_finite(), "gradient {g}");
        assert!(g.x < 0.0 && g.y > 0.0);
    }

    #[test]
    fn test_grad_matches_finite_difference() {
        let m = four_corners();
        let p = Vec2::new(0.1, 0.3);
        let h = 1e-3;
        let fd = Vec2::new(
            (m.evaluate(p + Vec2::X * h).ln() - m.evaluate(p - Vec2::X * h).ln()) / (2.0 * h),
            (m.evaluate(p + Vec2::Y * h).ln() - m.evaluate(p - Vec2::Y * h).ln()) / (2.0 * h),
        );
        let g = m.grad_log_density(p);
        assert_relative_eq!(g.x, fd.x, max_relative = 1e-2);
        assert_relative_eq!(g.y, fd.y, max_relative = 1e-2);
    }

    #[test]
    fn test_gpu_layout() {
        assert_eq!(std::mem::size_of::<GpuGaussian>(), 16);
        assert_eq!(std::mem::size_of::<GpuMixture>(), 176);

        let m = four_corners();
        let gpu = m.to_gpu();
        assert_eq!(gpu.count, 4);
        assert_eq!(gpu.peak, m.peak());
        assert_eq!(gpu.components[3].mean, [0.5, -0.5]);
        assert_eq!(gpu.components[4].sigma, [0.0, 0.0]);
    }

    #[test]
    fn test_serde_clamps_sigma() {
        let g: Gaussian = serde_json::from_str(r#"{"mean":[0.5,0.0],"sigma":[0.0,0.2]}"#).unwrap();
        assert_eq!(g.sigma(), Vec2::new(SIGMA_FLOOR, 0.2));
        let json = serde_json::to_string(&g).unwrap();
        assert!(json.contains("\"mean\":[0.5,0.0]"));
    }
}
