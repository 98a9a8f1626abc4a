//! Market-return sources.
//!
//! The simulator draws exactly one fractional return per payout year from a
//! [`ReturnSource`]. Production runs use [`MarketReturns`]; tests replay fixed
//! paths through [`ReturnSequence`] or [`ConstantReturn`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait ReturnSource {
    fn next_return(&mut self) -> f64;
}

impl<S: ReturnSource + ?Sized> ReturnSource for &mut S {
    fn next_return(&mut self) -> f64 {
        (**self).next_return()
    }
}

impl<S: ReturnSource + ?Sized> ReturnSource for Box<S> {
    fn next_return(&mut self) -> f64 {
        (**self).next_return()
    }
}

/// Bounded uniform noise around a long-run growth assumption:
/// `growth + (u - noise_offset) * noise_spread`, `u` in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct MarketReturns {
    rng: StdRng,
    growth_rate: f64,
    noise_offset: f64,
    noise_spread: f64,
}

impl MarketReturns {
    pub const DEFAULT_NOISE_OFFSET: f64 = 0.4;
    pub const DEFAULT_NOISE_SPREAD: f64 = 0.2;

    pub fn new(seed: u64, growth_rate: f64) -> Self {
        Self::with_noise(
            seed,
            growth_rate,
            Self::DEFAULT_NOISE_OFFSET,
            Self::DEFAULT_NOISE_SPREAD,
        )
    }

    pub fn with_noise(seed: u64, growth_rate: f64, noise_offset: f64, noise_spread: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            growth_rate,
            noise_offset,
            noise_spread,
        }
    }

    /// Inclusive lower and exclusive upper bound of every draw.
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.growth_rate - self.noise_offset * self.noise_spread,
            self.growth_rate + (1.0 - self.noise_offset) * self.noise_spread,
        )
    }
}

impl ReturnSource for MarketReturns {
    fn next_return(&mut self) -> f64 {
        let u: f64 = self.rng.gen_range(0.0..1.0);
        (u - self.noise_offset) * self.noise_spread + self.growth_rate
    }
}

/// Replays a fixed path of returns, wrapping around when exhausted.
#[derive(Debug, Clone)]
pub struct ReturnSequence {
    returns: Vec<f64>,
    cursor: usize,
}

impl ReturnSequence {
    pub fn new(returns: impl Into<Vec<f64>>) -> Self {
        Self {
            returns: returns.into(),
            cursor: 0,
        }
    }
}

impl ReturnSource for ReturnSequence {
    fn next_return(&mut self) -> f64 {
        if self.returns.is_empty() {
            return 0.0;
        }
        let value = self.returns[self.cursor % self.returns.len()];
        self.cursor += 1;
        value
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantReturn(pub f64);

impl ReturnSource for ConstantReturn {
    fn next_return(&mut self) -> f64 {
        self.0
    }
}

/// Derives an independent stream seed from a base seed.
pub fn derive_seed(base_seed: u64, stream: u64) -> u64 {
    splitmix64(base_seed ^ stream.rotate_left(32))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
