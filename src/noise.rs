//! Counter-based noise for the integrator.
//!
//! Each `(seed, step, particle)` triple gets its own short splitmix64 stream,
//! so particles can be advanced in any order, on any thread, and a step
//! replays bit-for-bit.

use glam::Vec2;
use rand_core::RngCore;
use std::f32::consts::TAU;

const GOLDEN_GAMMA: u64 = 0x9e3779b97f4a7c15;

/// Splitmix64 finaliser
#[inline(always)]
fn mix_seed(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Seed from OS entropy, falling back to the clock.
pub fn random_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::fill(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(err) => {
            log::warn!("OS entropy unavailable ({err}), seeding from clock");
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(GOLDEN_GAMMA)
        }
    }
}

/// Random stream for one particle in one step
#[derive(Debug, Clone)]
pub struct ParticleRng {
    state: u64,
}

impl ParticleRng {
    #[inline]
    pub fn new(seed: u64, step: u64, particle: u64) -> Self {
        let key = mix_seed(seed) ^ mix_seed(step.wrapping_mul(GOLDEN_GAMMA) ^ particle.rotate_left(29));
        Self {
            state: mix_seed(key),
        }
    }

    /// Two independent standard normal samples (Box-Muller)
    #[inline]
    pub fn standard_normal2(&mut self) -> Vec2 {
        standard_normal2(self)
    }
}

impl RngCore for ParticleRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(GOLDEN_GAMMA);
        mix_seed(self.state)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Two independent standard normal samples from any generator
#[inline]
pub fn standard_normal2<R: RngCore + ?Sized>(rng: &mut R) -> Vec2 {
    // u1 in (0, 1] keeps ln finite
    let u1 = ((rng.next_u32() >> 8) + 1) as f32 / 16_777_216.0;
    let u2 = (rng.next_u32() >> 8) as f32 / 16_777_216.0;
    let r = (-2.0 * u1.ln()).sqrt();
    let (s, c) = (TAU * u2).sin_cos();
    Vec2::new(r * c, r * s)
}
