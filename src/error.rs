//! Error type shared by every backend.
//!
//! Only construction and device plumbing can fail. Out-of-range model
//! parameters are clamped where they are set and never show up here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No compute adapter could be acquired.
    #[error("no compute adapter available: {0}")]
    NoAdapter(String),

    #[error("failed to create device: {0}")]
    RequestDevice(String),

    /// Kernel source or pipeline rejected by the driver. `diagnostics` is the
    /// validation message exactly as reported.
    #[error("kernel `{label}` failed to build:\n{diagnostics}")]
    KernelCompile { label: String, diagnostics: String },

    #[error("buffer map failed: {0}")]
    BufferMap(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("invalid {what} grid {width}x{height}: both sides must be non-zero")]
    InvalidGrid {
        what: &'static str,
        width: usize,
        height: usize,
    },

    #[error("config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn check_grid(what: &'static str, width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidGrid {
            what,
            width,
            height,
        });
    }
    Ok(())
}
