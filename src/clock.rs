//! The `Clock` capability consumed by the Retriever and Indexer (spec.md
//! §6): wall-clock plus monotonic time, injected so soft deadlines and
//! retry backoff are testable without real sleeps.

use std::time::Instant;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock fixed at construction time, for deterministic tests (spec.md §8
/// "Retrieval determinism").
#[derive(Debug, Clone)]
pub struct FixedClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl FixedClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self { wall, mono: Instant::now() }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.wall
    }

    fn monotonic(&self) -> Instant {
        self.mono
    }
}
