//! `Deps { config, clock, rng, persistence, token_validator }`: every
//! side-effecting or non-deterministic capability the Control Plane
//! needs is injected here rather than reached for as a module-level
//! global, so that scenario tests can swap in a fixed clock and a
//! deterministic rng and get reproducible subdomain assignment and
//! timestamps. Logging itself needs no injection point — `tracing`'s
//! subscriber is process-global by design.

use crate::config::Config;
use crate::persistence::PersistenceAdapter;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Wall-clock time and monotonic ids, abstracted so tests can hold time
/// and randomness still.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to, for deterministic tests of
/// `completed_at >= received_at` and similar invariants.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Randomness used for subdomain label generation. Kept behind a trait
/// plus mutex so a seeded `StdRng` can make the collision-retry path
/// exercised deterministically in tests.
pub trait Rng: Send + Sync {
    fn gen_range(&self, lo: u32, hi: u32) -> u32;
}

pub struct OsRng(Mutex<StdRng>);

impl Default for OsRng {
    fn default() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }
}

impl Rng for OsRng {
    fn gen_range(&self, lo: u32, hi: u32) -> u32 {
        self.0.lock().unwrap().gen_range(lo..hi)
    }
}

/// A seeded rng for deterministic tests.
pub struct SeededRng(Mutex<StdRng>);

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl Rng for SeededRng {
    fn gen_range(&self, lo: u32, hi: u32) -> u32 {
        self.0.lock().unwrap().gen_range(lo..hi)
    }
}

/// "validate this token -> user id" — the only shape this crate
/// consumes from the out-of-scope auth service.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, bearer_token: &str) -> Option<Uuid>;
}

/// Accepts no token ever; every handshake without a recognised token
/// is unassociated. Used when no real validator is wired in.
#[derive(Debug, Default)]
pub struct NullTokenValidator;

impl TokenValidator for NullTokenValidator {
    fn validate(&self, _bearer_token: &str) -> Option<Uuid> {
        None
    }
}

/// The explicit capability bundle passed to the Control Plane at
/// construction, instead of module-level statics.
#[derive(Clone)]
pub struct Deps {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<dyn Rng>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub token_validator: Arc<dyn TokenValidator>,
}

impl Deps {
    pub fn new(
        config: Config,
        persistence: Arc<dyn PersistenceAdapter>,
        token_validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            rng: Arc::new(OsRng::default()),
            persistence,
            token_validator,
        }
    }

    #[cfg(test)]
    pub fn test_default() -> Self {
        use crate::persistence::InMemoryPersistence;
        Self {
            config: Arc::new(Config::default()),
            clock: Arc::new(SystemClock),
            rng: Arc::new(SeededRng::new(1)),
            persistence: Arc::new(InMemoryPersistence::default()),
            token_validator: Arc::new(NullTokenValidator),
        }
    }
}
