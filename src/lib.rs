//! # Langevin
//!
//! A large grid of independent particles driven by overdamped Langevin
//! dynamics in the potential of a mixture of 2D Gaussians, with a live
//! comparison between the particles' empirical density and the mixture's
//! analytic density.
//!
//! Each frame:
//! 1. a pending mixture edit is handed to the backend (peak recomputed)
//! 2. every particle advances one step, reading one buffer and writing the
//!    other
//! 3. the readable buffer is binned into a fixed-resolution accumulator and
//!    normalised into a density estimate on the left half of the surface
//! 4. the mixture is evaluated per pixel on the right half
//!
//! Both halves share one view and one colour scale referenced to the
//! mixture peak.
//!
//! ## Example
//!
//! ```rust
//! use langevin::{Config, GridSize, Session};
//!
//! let config = Config {
//!     particles: GridSize::new(64, 64),
//!     seed: Some(7),
//!     ..Config::default()
//! };
//! let mut session = Session::with_cpu(&config).unwrap();
//! for _ in 0..10 {
//!     session.frame(320, 160).unwrap();
//! }
//! let stats = session.estimate_stats().unwrap();
//! assert_eq!(stats.total_mass + stats.clipped, 64 * 64);
//! ```
//!
//! The CPU backend is always available. Enable the `gpu` feature for the
//! wgpu compute backend.

pub mod backend;
pub mod config;
pub mod density;
pub mod error;
pub mod field;
pub mod mixture;
pub mod noise;
pub mod render;
pub mod session;
pub mod viewport;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{Backend, CpuBackend};
pub use config::{Config, GridSize};
pub use density::{DensityAccumulator, DensityEstimator, EstimateStats};
pub use error::{Error, Result};
pub use field::{Integrator, LangevinKernel, ParticleField, Slot};
pub use mixture::{Gaussian, MAX_COMPONENTS, MixtureOfGaussians};
pub use noise::ParticleRng;
pub use render::{AnalyticRenderer, ParticleRenderer, Surface};
pub use session::{LeftPane, Session};
pub use viewport::{FrameLayout, ViewState, ViewTransform, Viewport, enforce_aspect_ratio};

#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;

/// Build a backend by name, falling back to the CPU when `gpu` is requested
/// but the feature is off.
pub fn create_backend(config: &Config, gpu: bool) -> Result<Box<dyn Backend>> {
    let seed = config.seed();
    #[cfg(feature = "gpu")]
    {
        if gpu {
            return Ok(Box::new(GpuBackend::new(config.particles, config.accumulator, seed)?));
        }
    }
    #[cfg(not(feature = "gpu"))]
    {
        if gpu {
            log::warn!("built without the `gpu` feature, using the CPU backend");
        }
    }
    Ok(Box::new(CpuBackend::new(config.particles, config.accumulator, seed)?))
}
