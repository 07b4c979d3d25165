//! Pure generator of retry delays (spec §4.1, component C1).
//!
//! `Backoff` is deterministic given its seed and produces a sequence of
//! delay values in milliseconds. It knows nothing about HTTP, tokens, or the
//! server state machine - [`crate::server::TokenServer`] is the only caller.

use rand::Rng;

use crate::error::{Error, Result};

/// Selects which of the three delay algorithms a [`Backoff`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// Uniform in `[min, max]` on every call; `reset` is a no-op.
    Rand,
    /// Doubles each call, starting at `min`, capped at `max`.
    Exp,
    /// Uniform in a window that tracks the previous delay; see
    /// [`Backoff::next`] for the exact bounds.
    #[default]
    RandExp,
}

/// Generator of bounded, jittered retry delays. One instance belongs to
/// exactly one [`crate::server::TokenServer`] and is never shared across
/// servers (spec §3, `BackoffState`).
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
    min: u64,
    max: u64,
    prev: Option<u64>,
    rng: rand::rngs::StdRng,
}

impl Backoff {
    /// Default `min`/`max` per spec §4.1.
    pub const DEFAULT_MIN_MS: u64 = 1_000;
    pub const DEFAULT_MAX_MS: u64 = 30_000;

    /// Construct a new generator. Fails with [`Error::Config`] if `min > max`
    /// (the signed `min`/`max < 0` case from spec §4.1 cannot arise here
    /// since this constructor takes `u64`; callers building from
    /// caller-supplied, possibly-negative configuration should validate
    /// before converting - see [`crate::server::StartOptions`]).
    pub fn new(kind: BackoffKind, min: u64, max: u64) -> Result<Self> {
        if min > max {
            return Err(Error::Config(format!(
                "backoff min ({min}) must be <= max ({max})"
            )));
        }
        Ok(Self {
            kind,
            min,
            max,
            prev: None,
            rng: rand::SeedableRng::from_entropy(),
        })
    }

    #[must_use]
    pub fn min(&self) -> u64 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Produce the next delay in milliseconds. Always in `[min, max]`.
    pub fn next(&mut self) -> u64 {
        let delay = match self.kind {
            BackoffKind::Exp => {
                let next = match self.prev {
                    None => self.min,
                    Some(prev) => prev.saturating_mul(2).min(self.max),
                };
                self.prev = Some(next);
                next
            }
            BackoffKind::Rand => self.uniform(self.min, self.max),
            BackoffKind::RandExp => {
                let lower = self.min.max(self.max / 3);
                let prev = self.prev.unwrap_or(self.min);
                let lo = prev.min(lower).max(self.min);
                let hi = prev.saturating_mul(3).min(self.max).max(lo);
                let delay = self.uniform(lo, hi);
                self.prev = Some(delay);
                delay
            }
        };
        debug_assert!(delay >= self.min && delay <= self.max);
        delay
    }

    /// Reset the generator. For `:rand` this is a no-op (the rng sequence
    /// continues); `:exp` and `:rand_exp` forget the previous delay so the
    /// next call behaves as if freshly constructed (spec §4.1).
    pub fn reset(&mut self) {
        if !matches!(self.kind, BackoffKind::Rand) {
            self.prev = None;
        }
    }

    fn uniform(&mut self, lo: u64, hi: u64) -> u64 {
        if lo >= hi {
            return lo;
        }
        self.rng.gen_range(lo..=hi)
    }
}

impl Default for Backoff {
    /// `rand_exp, 1000, 30000` per spec §4.1's defaults.
    fn default() -> Self {
        Self::new(BackoffKind::RandExp, Self::DEFAULT_MIN_MS, Self::DEFAULT_MAX_MS)
            .expect("default min/max are valid")
    }
}
