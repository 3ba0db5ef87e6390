use crate::time::Timestamp;
use chrono::{DateTime, FixedOffset, TimeDelta};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Source of "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Source of fresh identifiers
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Wall clock in the system's local zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that advances by a fixed step on every reading.
///
/// Readings are strictly increasing across threads.
#[derive(Debug)]
pub struct SteppingClock {
    origin: DateTime<FixedOffset>,
    step_ms: i64,
    ticks: AtomicI64,
}

impl SteppingClock {
    pub fn new(origin: DateTime<FixedOffset>, step_ms: i64) -> Self {
        Self {
            origin,
            step_ms,
            ticks: AtomicI64::new(0),
        }
    }

    /// Number of readings taken so far
    pub fn readings(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Timestamp {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        (self.origin + TimeDelta::milliseconds(tick * self.step_ms)).into()
    }
}

/// Random UUID v4 identifiers
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `prefix-1`, `prefix-2`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

/// Clock and id generator shared by everything built from it.
///
/// Every id and every lifecycle timestamp is produced through an
/// `Environment` instead of ambient globals, so tests can substitute
/// deterministic stand-ins.
#[derive(Clone)]
pub struct Environment {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Environment {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { clock, ids }
    }

    /// Local wall clock and UUID v4 ids
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(UuidGenerator))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}
