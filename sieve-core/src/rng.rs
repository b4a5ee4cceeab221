//! Deterministic seed hierarchy for synthetic data.
//!
//! A master seed generates deterministic sub-seeds for each
//! `(session, stream, instrument)` tuple. Sub-seeds are derived via BLAKE3,
//! independently of thread scheduling order, so synthetic data is identical no
//! matter how the worker pool interleaves instruments.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::domain::SessionId;

/// Which synthetic dataset a seed feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStream {
    Reference,
    DailyBars,
    IntradayBars,
    Ticks,
    Live,
}

impl SeedStream {
    fn tag(&self) -> &'static [u8] {
        match self {
            Self::Reference => b"reference",
            Self::DailyBars => b"daily",
            Self::IntradayBars => b"intraday",
            Self::Ticks => b"ticks",
            Self::Live => b"live",
        }
    }
}

/// Deterministic seed hierarchy.
#[derive(Debug, Clone)]
pub struct SeedHierarchy {
    master_seed: u64,
    session: SessionId,
}

impl SeedHierarchy {
    pub fn new(master_seed: u64, session: SessionId) -> Self {
        Self {
            master_seed,
            session,
        }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Derive a sub-seed for a `(stream, key)` pair.
    ///
    /// `key` is usually an instrument id; derivation order does not matter.
    pub fn sub_seed(&self, stream: SeedStream, key: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(self.session.as_bytes());
        hasher.update(stream.tag());
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    /// Seeded StdRng for a `(stream, key)` pair.
    pub fn rng_for(&self, stream: SeedStream, key: &str) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(stream, key))
    }
}
