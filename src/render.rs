//! Output surface and the renderers that draw into it.

use crate::density::DensityAccumulator;
use crate::mixture::MixtureOfGaussians;
use crate::viewport::{ViewTransform, Viewport};
use glam::Vec2;
use rayon::prelude::*;

pub type Rgba = [u8; 4];

pub const BACKGROUND: Rgba = [0, 0, 0, 255];

/// RGBA8 image, row 0 at the top
#[derive(Debug, Clone, Default)]
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<Rgba>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![BACKGROUND; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[Rgba] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgba] {
        &mut self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Raw RGBA bytes
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    /// Match the display size; contents are undefined afterwards.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width != self.width || height != self.height {
            log::debug!("surface resized to {width}x{height}");
            self.width = width;
            self.height = height;
            self.pixels.resize(width as usize * height as usize, BACKGROUND);
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(BACKGROUND);
    }

    /// Set every pixel inside `region` to `shade(x, y)`, one rayon task per
    /// row.
    pub fn fill_region(&mut self, region: &Viewport, shade: impl Fn(u32, u32) -> Rgba + Sync) {
        let (x0, y0, x1, y1) = region.pixel_bounds(self.width, self.height);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let width = self.width as usize;
        self.pixels
            .par_chunks_mut(width)
            .enumerate()
            .skip(y0 as usize)
            .take((y1 - y0) as usize)
            .for_each(|(y, row)| {
                for x in x0..x1 {
                    row[x as usize] = shade(x, y as u32);
                }
            });
    }
}

/// Colour ramp stops, dark to bright
const RAMP: [[f32; 3]; 5] = [
    [0.0, 0.0, 4.0],
    [87.0, 16.0, 110.0],
    [188.0, 55.0, 84.0],
    [249.0, 142.0, 9.0],
    [252.0, 255.0, 164.0],
];

/// Map `t` in `[0, 1]` onto the shared colour ramp. Out-of-range values
/// saturate and NaN maps to the darkest colour.
pub fn colormap(t: f32) -> Rgba {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let scaled = t * (RAMP.len() - 1) as f32;
    let i = (scaled as usize).min(RAMP.len() - 2);
    let f = scaled - i as f32;
    let (a, b) = (RAMP[i], RAMP[i + 1]);
    let lerp = |k: usize| (a[k] + (b[k] - a[k]) * f).round() as u8;
    [lerp(0), lerp(1), lerp(2), 255]
}

/// Display intensity of `density` relative to `peak`
#[inline]
pub fn intensity(density: f32, peak: f32) -> f32 {
    if peak > 0.0 { density / peak } else { 0.0 }
}

/// Direct per-pixel evaluation of the mixture
#[derive(Debug, Clone, Default)]
pub struct AnalyticRenderer {
    mixture: MixtureOfGaussians,
}

impl AnalyticRenderer {
    pub fn new(mixture: &MixtureOfGaussians) -> Self {
        Self {
            mixture: mixture.clone(),
        }
    }

    pub fn set_mixture(&mut self, mixture: &MixtureOfGaussians) {
        self.mixture = mixture.clone();
    }

    pub fn render(&self, transform: &ViewTransform, surface: &mut Surface) {
        let peak = self.mixture.peak();
        surface.fill_region(&transform.pixels, |x, y| {
            let p = transform.sim_at_pixel(x, y);
            colormap(intensity(self.mixture.evaluate(p), peak))
        });
    }
}

/// Plots particles as points, brightness saturating with the number of
/// particles per pixel.
#[derive(Debug, Clone)]
pub struct ParticleRenderer {
    plot: DensityAccumulator,
    color: [f32; 3],
    /// Particles per pixel at which brightness reaches ~63%
    saturation: f32,
}

impl Default for ParticleRenderer {
    fn default() -> Self {
        Self::new([0.4, 0.7, 1.0], 4.0)
    }
}

impl ParticleRenderer {
    pub fn new(color: [f32; 3], saturation: f32) -> Self {
        Self {
            // resized to the pixel viewport on first use
            plot: DensityAccumulator::default(),
            color,
            saturation: saturation.max(f32::EPSILON),
        }
    }

    pub fn render(&mut self, particles: &[Vec2], transform: &ViewTransform, surface: &mut Surface) {
        let (x0, y0, x1, y1) = transform.pixels.pixel_bounds(surface.width(), surface.height());
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        self.plot.resize((x1 - x0) as usize, (y1 - y0) as usize);
        self.plot.accumulate(particles, &transform.sim);

        let plot = &self.plot;
        let (color, saturation) = (self.color, self.saturation);
        surface.fill_region(&transform.pixels, |x, y| {
            let hits = plot
                .cell_of(&transform.sim, transform.sim_at_pixel(x, y))
                .map_or(0, |i| plot.cells()[i]);
            let b = 1.0 - (-(hits as f32) / saturation).exp();
            let c = |k: usize| (color[k] * b * 255.0).round() as u8;
            [c(0), c(1), c(2), 255]
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::Gaussian;

    fn unit() -> Viewport {
        Viewport::new(Vec2::splat(-1.0), Vec2::splat(1.0))
    }

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(colormap(0.0), [0, 0, 4, 255]);
        assert_eq!(colormap(1.0), [252, 255, 164, 255]);
        assert_eq!(colormap(7.5), colormap(1.0));
        assert_eq!(colormap(-1.0), colormap(0.0));
        assert_eq!(colormap(f32::NAN), colormap(0.0));
    }

    #[test]
    fn test_colormap_monotone_brightness() {
        let luma = |c: Rgba| c[0] as u32 + c[1] as u32 + c[2] as u32;
        let mut last = 0;
        for i in 0..=20 {
            let l = luma(colormap(i as f32 / 20.0));
            assert!(l >= last);
            last = l;
        }
    }

    #[test]
    fn test_surface_resize_and_index() {
        let mut s = Surface::new(3, 2);
        s.pixels_mut()[5] = [1, 2, 3, 255];
        assert_eq!(s.pixel(2, 1), [1, 2, 3, 255]);
        s.resize(70_000, 1);
        assert_eq!(s.pixels().len(), 70_000);
        assert_eq!(s.as_bytes().len(), 280_000);
    }

    #[test]
    fn test_fill_region_only_touches_region() {
        let mut s = Surface::new(10, 4);
        let region = Viewport::new(Vec2::new(5.0, 0.0), Vec2::new(10.0, 4.0));
        s.fill_region(&region, |_, _| [1, 2, 3, 4]);
        assert_eq!(s.pixel(4, 2), BACKGROUND);
        assert_eq!(s.pixel(5, 0), [1, 2, 3, 4]);
        assert_eq!(s.pixel(9, 3), [1, 2, 3, 4]);
        assert_eq!(s.as_bytes().len(), 10 * 4 * 4);
    }

    #[test]
    fn test_analytic_peak_is_brightest() {
        let m = MixtureOfGaussians::from_components([Gaussian::new(Vec2::ZERO, Vec2::splat(0.2))]);
        let mut s = Surface::new(41, 41);
        let t = ViewTransform::new(unit(), Viewport::new(Vec2::ZERO, Vec2::splat(41.0)));
        AnalyticRenderer::new(&m).render(&t, &mut s);
        // the centre pixel sits exactly on the mean
        assert_eq!(s.pixel(20, 20), colormap(1.0));
        assert_eq!(s.pixel(0, 0), colormap(0.0));
    }

    #[test]
    fn test_analytic_y_up() {
        let m = MixtureOfGaussians::from_components([Gaussian::new(Vec2::new(0.0, 0.8), Vec2::splat(0.1))]);
        let mut s = Surface::new(20, 20);
        let t = ViewTransform::new(unit(), Viewport::new(Vec2::ZERO, Vec2::splat(20.0)));
        AnalyticRenderer::new(&m).render(&t, &mut s);
        let luma = |c: Rgba| c[0] as u32 + c[1] as u32 + c[2] as u32;
        assert!(luma(s.pixel(10, 2)) > luma(s.pixel(10, 17)));
    }

    #[test]
    fn test_particle_plot() {
        let mut s = Surface::new(10, 10);
        let t = ViewTransform::new(unit(), Viewport::new(Vec2::ZERO, Vec2::splat(10.0)));
        let particles = vec![Vec2::new(0.95, 0.95); 20];
        ParticleRenderer::default().render(&particles, &t, &mut s);
        assert_ne!(s.pixel(9, 0), BACKGROUND);
        assert_eq!(s.pixel(0, 9), [0, 0, 0, 255]);
    }
}
