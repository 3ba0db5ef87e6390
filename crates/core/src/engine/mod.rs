pub mod status;

pub use status::EngineStatus;

use crate::error::{Error, Fault, Result};
use serde::{Deserialize, Serialize};
use status::EngineCounters;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Engine configuration, typically parsed from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of execution slots. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Reported keep-alive in milliseconds. Slots live as long as the engine.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_worker_threads() -> usize {
    0
}

fn default_keep_alive_ms() -> u64 {
    60_000
}

fn default_thread_name() -> String {
    "workflows-worker".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            keep_alive_ms: default_keep_alive_ms(),
            thread_name: default_thread_name(),
        }
    }
}

impl EngineConfig {
    pub fn with_worker_threads(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Default::default()
        }
    }

    /// Resolve worker thread count (0 means use available parallelism)
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }
}

/// Fixed pool of execution slots accepting blocking computations.
///
/// Each slot is a dedicated rayon worker thread. Cloning is cheap and every
/// clone submits to the same slots, so one engine can be shared by all groups
/// of a pipeline.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    /// `None` once the engine is shut down
    pool: RwLock<Option<rayon::ThreadPool>>,
    counters: Arc<EngineCounters>,
    slots: usize,
    keep_alive_ms: u64,
}

impl ExecutionEngine {
    /// Create an engine with `slots` execution slots
    pub fn new(slots: usize) -> Result<Self> {
        Self::with_config(EngineConfig::with_worker_threads(slots))
    }

    /// One slot per available processor
    pub fn from_available_parallelism() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let slots = config.resolved_worker_threads();
        let thread_name = config.thread_name.clone();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(slots)
            .thread_name(move |i| format!("{}-{}", thread_name, i))
            .build()
            .map_err(|e| Error::Engine(e.to_string()))?;

        tracing::info!(slots, keep_alive_ms = config.keep_alive_ms, "Execution engine started");

        Ok(Self {
            inner: Arc::new(EngineInner {
                pool: RwLock::new(Some(pool)),
                counters: Arc::new(EngineCounters::default()),
                slots,
                keep_alive_ms: config.keep_alive_ms,
            }),
        })
    }

    /// Number of execution slots
    pub fn slots(&self) -> usize {
        self.inner.slots
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Hand a computation to the pool without blocking.
    ///
    /// A panic inside the computation resolves the handle with
    /// [`Error::Panicked`].
    pub fn submit<T, F>(&self, computation: F) -> ExecutionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let guard = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(pool) = guard.as_ref() else {
            let _ = tx.send(Err(Error::EngineClosed));
            return ExecutionHandle { receiver: rx };
        };

        self.inner.counters.accept();
        let counters = Arc::clone(&self.inner.counters);

        pool.spawn(move || {
            let outcome = {
                let _slot = counters.enter();
                panic::catch_unwind(AssertUnwindSafe(computation))
                    .unwrap_or_else(|payload| Err(Error::Panicked(Fault::from_panic(payload))))
            };
            // Receiver may be gone if the caller abandoned the handle
            let _ = tx.send(outcome);
        });

        ExecutionHandle { receiver: rx }
    }

    /// Submit an action without a meaningful return value
    pub fn submit_detached<F>(&self, action: F) -> ExecutionHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            action();
            Ok(())
        })
    }

    /// Current counters of the pool
    pub fn status(&self) -> EngineStatus {
        let pool_size = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |pool| pool.current_num_threads());
        self.inner
            .counters
            .snapshot(self.inner.slots, pool_size, self.inner.keep_alive_ms)
    }

    /// Stop accepting work and tear the pool down, waiting up to `timeout`
    /// for accepted computations to settle.
    pub fn shutdown(&self, timeout: Duration) {
        let pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(pool) = pool else {
            return;
        };
        tracing::info!("Shutting down execution engine");

        let deadline = Instant::now() + timeout;
        while !self.inner.counters.is_idle() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if !self.inner.counters.is_idle() {
            tracing::warn!("Execution engine shut down with computations still running");
        }

        // Workers exit once their current job is done
        drop(pool);
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("slots", &self.inner.slots)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pending result of a submitted computation
#[derive(Debug)]
pub struct ExecutionHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> ExecutionHandle<T> {
    /// Block until the computation settles.
    ///
    /// May be called from a slot, for a computation that waits on work it
    /// submitted itself. Must not be called from inside an async context.
    pub fn join(self) -> Result<T> {
        self.receiver
            .blocking_recv()
            .map_err(|_| Error::HandleDropped)?
    }
}
