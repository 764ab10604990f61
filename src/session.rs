//! The owning application context: mixture, time step, view and backend,
//! advanced one frame at a time.

use crate::backend::{Backend, CpuBackend};
use crate::config::{Config, DT_MAX, DT_MIN};
use crate::density::EstimateStats;
use crate::error::Result;
use crate::mixture::MixtureOfGaussians;
use crate::render::Surface;
use crate::viewport::{FrameLayout, ViewState};
use glam::Vec2;

/// What the left half of the frame shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeftPane {
    #[default]
    Estimate,
    Particles,
}

impl LeftPane {
    pub fn toggle(self) -> Self {
        match self {
            LeftPane::Estimate => LeftPane::Particles,
            LeftPane::Particles => LeftPane::Estimate,
        }
    }
}

pub struct Session {
    backend: Box<dyn Backend>,
    mixture: MixtureOfGaussians,
    mixture_changed: bool,
    dt: f32,
    view: ViewState,
    pane: LeftPane,
    paused: bool,
    surface: Surface,
    layout: FrameLayout,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("steps", &self.backend.steps())
            .field("mixture", &self.mixture)
            .field("dt", &self.dt)
            .field("view", &self.view)
            .field("pane", &self.pane)
            .field("paused", &self.paused)
            .finish()
    }
}

impl Session {
    pub fn new(config: &Config, backend: Box<dyn Backend>) -> Self {
        let (width, height) = config.window.extent();
        Self {
            backend,
            mixture: config.build_mixture(),
            // the backend has not seen this mixture yet
            mixture_changed: true,
            dt: if config.dt.is_nan() { DT_MIN } else { config.dt.clamp(DT_MIN, DT_MAX) },
            view: config.view,
            pane: LeftPane::default(),
            paused: false,
            surface: Surface::new(width, height),
            layout: FrameLayout::split(&config.view, width, height),
        }
    }

    /// Session on the CPU reference backend
    pub fn with_cpu(config: &Config) -> Result<Self> {
        let backend = CpuBackend::new(config.particles, config.accumulator, config.seed())?;
        Ok(Self::new(config, Box::new(backend)))
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn mixture(&self) -> &MixtureOfGaussians {
        &self.mixture
    }

    /// Mutate the mixture. The backend picks up the change at the start of
    /// the next frame, never part-way through one.
    pub fn edit_mixture<R>(&mut self, f: impl FnOnce(&mut MixtureOfGaussians) -> R) -> R {
        self.mixture_changed = true;
        f(&mut self.mixture)
    }

    pub fn mixture_changed(&self) -> bool {
        self.mixture_changed
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f32) {
        if !dt.is_nan() {
            self.dt = dt.clamp(DT_MIN, DT_MAX);
        }
    }

    /// Multiply `dt` by `factor`, the logarithmic adjustment the controls use.
    pub fn scale_dt(&mut self, factor: f32) {
        self.set_dt(self.dt * factor);
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ViewState {
        &mut self.view
    }

    /// Pan by a drag of `delta` surface pixels, scaled by the pane under
    /// `at`.
    pub fn pan(&mut self, at: Vec2, delta: Vec2) {
        let pixels = self.layout.pane_at(at).pixels;
        self.view.pan_by_pixels(delta, pixels);
    }

    pub fn pane(&self) -> LeftPane {
        self.pane
    }

    pub fn set_pane(&mut self, pane: LeftPane) {
        self.pane = pane;
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Layout of the most recent frame
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn reset_particles(&mut self, seed: u64) -> Result<()> {
        self.backend.reset_particles(seed)
    }

    /// Hand a pending mixture change to the backend before anything reads it.
    fn sync_mixture(&mut self) -> Result<()> {
        if self.mixture_changed {
            self.mixture.update_peak();
            self.backend.set_mixture(&self.mixture)?;
            self.mixture_changed = false;
        }
        Ok(())
    }

    /// Sync a pending mixture change, then integrate one step unless paused.
    pub fn advance(&mut self) -> Result<()> {
        self.sync_mixture()?;
        if !self.paused {
            self.backend.step(self.dt)?;
        }
        Ok(())
    }

    /// Draw both halves for a `width x height` display.
    pub fn render(&mut self, width: u32, height: u32) -> Result<&Surface> {
        self.sync_mixture()?;
        self.surface.resize(width, height);
        self.surface.clear();
        self.layout = FrameLayout::split(&self.view, width, height);
        match self.pane {
            LeftPane::Estimate => self.backend.render(&self.layout, &mut self.surface)?,
            LeftPane::Particles => {
                self.backend.render_particles(&self.layout.estimate, &mut self.surface)?;
                self.backend.render_analytic(&self.layout.analytic, &mut self.surface)?;
            }
        }
        Ok(&self.surface)
    }

    /// One animation frame: sync, step, render.
    pub fn frame(&mut self, width: u32, height: u32) -> Result<&Surface> {
        self.advance()?;
        self.render(width, height)
    }

    /// Estimate statistics under the left pane's simulation viewport
    pub fn estimate_stats(&mut self) -> Result<EstimateStats> {
        self.sync_mixture()?;
        let sim = self.layout.estimate.sim;
        self.backend.estimate_stats(&sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridSize;
    use crate::mixture::Gaussian;
    use crate::render::{colormap, intensity};

    fn config() -> Config {
        Config {
            particles: GridSize::new(48, 24),
            accumulator: GridSize::new(20, 20),
            window: GridSize::new(80, 40),
            seed: Some(3),
            ..Config::default()
        }
    }

    #[test]
    fn test_frame_steps_and_renders() {
        let mut s = Session::with_cpu(&config()).unwrap();
        assert!(s.mixture_changed());
        let surface = s.frame(80, 40).unwrap();
        assert_eq!((surface.width(), surface.height()), (80, 40));
        assert!(!s.mixture_changed());
        assert_eq!(s.backend().steps(), 1);
    }

    #[test]
    fn test_paused_does_not_step() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.set_paused(true);
        s.frame(80, 40).unwrap();
        s.frame(80, 40).unwrap();
        assert_eq!(s.backend().steps(), 0);
    }

    #[test]
    fn test_edit_sets_flag_until_next_frame() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.frame(80, 40).unwrap();
        let removed = s.edit_mixture(|m| m.remove(0));
        assert!(removed.is_some());
        assert!(s.mixture_changed());
        assert_eq!(s.mixture().count(), 3);
        s.frame(80, 40).unwrap();
        assert!(!s.mixture_changed());
    }

    #[test]
    fn test_peak_fresh_after_edit() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.edit_mixture(|m| m.set_sigma(0, Vec2::splat(0.02)));
        let mut fresh = s.mixture().clone();
        fresh.update_peak();
        assert_eq!(fresh.peak(), s.mixture().peak());
    }

    #[test]
    fn test_render_before_advance_uses_session_mixture() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.render(80, 40).unwrap();
        assert!(!s.mixture_changed());
        let analytic = s.layout().analytic;
        let pixel = analytic.sim_to_pixel(Vec2::ZERO).floor();
        let (x, y) = (pixel.x as u32, pixel.y as u32);
        let m = s.mixture();
        let expected = colormap(intensity(m.evaluate(analytic.sim_at_pixel(x, y)), m.peak()));
        assert_eq!(s.surface().pixel(x, y), expected);
    }

    #[test]
    fn test_stats_after_edit_use_edited_mixture() {
        let c = config();
        let mut s = Session::with_cpu(&c).unwrap();
        s.render(80, 40).unwrap();
        s.edit_mixture(|m| m.set_mean(0, Vec2::new(0.9, 0.9)));
        let stats = s.estimate_stats().unwrap();
        assert!(!s.mixture_changed());

        let mut reference = CpuBackend::new(c.particles, c.accumulator, c.seed()).unwrap();
        reference.set_mixture(s.mixture()).unwrap();
        let expected = reference.estimate_stats(&s.layout().estimate.sim).unwrap();
        assert_eq!(stats, expected);
    }

    #[test]
    fn test_dt_clamped() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.set_dt(1.0);
        assert_eq!(s.dt(), DT_MAX);
        s.scale_dt(1e-9);
        assert_eq!(s.dt(), DT_MIN);
        s.set_dt(f32::NAN);
        assert_eq!(s.dt(), DT_MIN);
    }

    #[test]
    fn test_particle_pane_and_resize() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.set_pane(s.pane().toggle());
        assert_eq!(s.pane(), LeftPane::Particles);
        let surface = s.frame(120, 30).unwrap();
        assert_eq!(surface.pixels().len(), 120 * 30);
        assert_eq!(s.layout().width, 120);
    }

    #[test]
    fn test_pan_uses_left_pane_scale() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.render(80, 40).unwrap();
        // left pane is 40x40 pixels over a 2x2 view
        s.pan(Vec2::new(10.0, 10.0), Vec2::new(20.0, 0.0));
        assert!((s.view().center.x + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_pan_over_right_pane_uses_its_scale() {
        let mut s = Session::with_cpu(&config()).unwrap();
        s.render(81, 40).unwrap();
        let per_pixel = s.layout().analytic.sim_per_pixel();
        s.pan(Vec2::new(70.0, 20.0), Vec2::new(10.0, 4.0));
        assert!((s.view().center.x + 10.0 * per_pixel.x).abs() < 1e-5);
        assert!((s.view().center.y - 4.0 * per_pixel.y).abs() < 1e-5);
    }

    #[test]
    fn test_stats_after_convergence() {
        let mut c = config();
        c.particles = GridSize::new(100, 100);
        c.mixture = vec![Gaussian::new(Vec2::ZERO, Vec2::splat(0.3))];
        c.dt = 5e-3;
        let mut s = Session::with_cpu(&c).unwrap();
        for _ in 0..300 {
            s.advance().unwrap();
        }
        s.render(80, 40).unwrap();
        let stats = s.estimate_stats().unwrap();
        assert_eq!(stats.total_mass + stats.clipped, 10_000);
        assert!(stats.l1_error < 0.35, "{stats:?}");
    }
}
