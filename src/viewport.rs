//! Simulation-space and pixel-space rectangles and the maps between them.
//!
//! Pixel space has its origin at the top-left corner of the output surface
//! with y growing downward. Simulation space has y growing upward, so the
//! top pixel row maps to `sim.pmax.y`.

use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Smallest and largest allowed half-extent of the view
pub const SCALE_MIN: f32 = 0.01;
pub const SCALE_MAX: f32 = 10.0;

/// Multiplicative zoom per wheel notch
pub const ZOOM_STEP: f32 = 1.1;

/// Axis-aligned rectangle `[pmin, pmax]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub pmin: Vec2,
    pub pmax: Vec2,
}

impl Viewport {
    pub fn new(pmin: Vec2, pmax: Vec2) -> Self {
        Self { pmin, pmax }
    }

    /// Rectangle of the given size centred on `center`
    pub fn centered(center: Vec2, size: Vec2) -> Self {
        Self {
            pmin: center - size * 0.5,
            pmax: center + size * 0.5,
        }
    }

    pub fn width(&self) -> f32 {
        self.pmax.x - self.pmin.x
    }

    pub fn height(&self) -> f32 {
        self.pmax.y - self.pmin.y
    }

    pub fn size(&self) -> Vec2 {
        self.pmax - self.pmin
    }

    pub fn center(&self) -> Vec2 {
        (self.pmin + self.pmax) * 0.5
    }

    /// Half-open containment, `pmin <= p < pmax`
    pub fn contains(&self, p: Vec2) -> bool {
        p.cmpge(self.pmin).all() && p.cmplt(self.pmax).all()
    }

    /// Integer pixel bounds `(x0, y0, x1, y1)`, end-exclusive, clipped to a
    /// `width x height` surface. Adjacent viewports sharing an edge produce
    /// disjoint ranges.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let snap = |v: f32, max: u32| (v.round().max(0.0) as u32).min(max);
        (
            snap(self.pmin.x, width),
            snap(self.pmin.y, height),
            snap(self.pmax.x, width),
            snap(self.pmax.y, height),
        )
    }
}

/// Grow `sim` around its own centre so its aspect ratio matches `pixels`.
///
/// A wider-than-tall pixel viewport widens the simulation viewport to
/// `height * aspect`; otherwise the height grows to `width / aspect`.
/// Degenerate pixel viewports leave `sim` untouched.
pub fn enforce_aspect_ratio(sim: Viewport, pixels: Viewport) -> Viewport {
    if pixels.width() <= 0.0 || pixels.height() <= 0.0 {
        return sim;
    }
    let aspect = pixels.width() / pixels.height();
    let center = sim.center();
    if aspect > 1.0 {
        Viewport::centered(center, Vec2::new(sim.height() * aspect, sim.height()))
    } else {
        Viewport::centered(center, Vec2::new(sim.width(), sim.width() / aspect))
    }
}

/// A pixel viewport paired with the aspect-corrected simulation viewport it
/// displays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub sim: Viewport,
    pub pixels: Viewport,
}

impl ViewTransform {
    pub fn new(sim: Viewport, pixels: Viewport) -> Self {
        Self {
            sim: enforce_aspect_ratio(sim, pixels),
            pixels,
        }
    }

    /// Simulation units per pixel along each axis
    pub fn sim_per_pixel(&self) -> Vec2 {
        self.sim.size() / self.pixels.size()
    }

    pub fn pixel_to_sim(&self, p: Vec2) -> Vec2 {
        let local = (p - self.pixels.pmin) / self.pixels.size();
        Vec2::new(
            self.sim.pmin.x + local.x * self.sim.width(),
            self.sim.pmax.y - local.y * self.sim.height(),
        )
    }

    pub fn sim_to_pixel(&self, s: Vec2) -> Vec2 {
        let local = Vec2::new(
            (s.x - self.sim.pmin.x) / self.sim.width(),
            (self.sim.pmax.y - s.y) / self.sim.height(),
        );
        self.pixels.pmin + local * self.pixels.size()
    }

    /// Simulation coordinate at the centre of surface pixel `(x, y)`
    #[inline]
    pub fn sim_at_pixel(&self, x: u32, y: u32) -> Vec2 {
        self.pixel_to_sim(Vec2::new(x as f32 + 0.5, y as f32 + 0.5))
    }
}

/// Pan/zoom state of the shared view
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub center: Vec2,
    pub scale: f32,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            center: Vec2::ZERO,
            scale: 1.0,
        }
    }
}

impl ViewState {
    /// Square viewport of half-extent `scale` before aspect correction
    pub fn base_viewport(&self) -> Viewport {
        Viewport::new(
            self.center - Vec2::splat(self.scale),
            self.center + Vec2::splat(self.scale),
        )
    }

    /// Move the view by a mouse drag of `delta` pixels inside `pixels`.
    pub fn pan_by_pixels(&mut self, delta: Vec2, pixels: Viewport) {
        if delta == Vec2::ZERO {
            return;
        }
        let per_pixel = ViewTransform::new(self.base_viewport(), pixels).sim_per_pixel();
        if !per_pixel.is_finite() {
            return;
        }
        self.center.x -= delta.x * per_pixel.x;
        self.center.y += delta.y * per_pixel.y;
    }

    /// Zoom in for positive wheel motion, out for negative.
    pub fn zoom(&mut self, wheel: f32) {
        if wheel > 0.0 {
            self.scale /= ZOOM_STEP;
        } else if wheel < 0.0 {
            self.scale *= ZOOM_STEP;
        }
        self.scale = self.scale.clamp(SCALE_MIN, SCALE_MAX);
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale.clamp(SCALE_MIN, SCALE_MAX);
    }
}

/// The two disjoint halves of the output surface: estimated density on the
/// left, analytic density on the right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub estimate: ViewTransform,
    pub analytic: ViewTransform,
}

impl FrameLayout {
    pub fn split(view: &ViewState, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let half = w / 2.0;
        let base = view.base_viewport();
        let left = Viewport::new(Vec2::ZERO, Vec2::new(half, h));
        let right = Viewport::new(Vec2::new(half, 0.0), Vec2::new(w, h));
        Self {
            width,
            height,
            estimate: ViewTransform::new(base, left),
            analytic: ViewTransform::new(base, right),
        }
    }

    /// The pane under pixel `p`, the left one when `p` is outside both.
    pub fn pane_at(&self, p: Vec2) -> &ViewTransform {
        if self.analytic.pixels.contains(p) {
            &self.analytic
        } else {
            &self.estimate
        }
    }
}
