use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Identifies one graph arena, so that handles can't be used with a context
/// that didn't create them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        GraphId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The way dispatched calls are handled by a configured client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Calls run immediately on the calling thread and return concrete
    /// values.
    Sync,
    /// Calls are recorded as task nodes and only run when computed.
    Deferred,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Sync => write!(f, "sync"),
            Mode::Deferred => write!(f, "deferred"),
        }
    }
}

/// Settings used by `set_client` to bring up an execution client.
///
/// The field names follow the pipeline parameter files, so a JSON document
/// with `use_dask`, `n_workers` and `memory_limit` keys deserializes
/// directly.
///
/// ```rust
/// # use arlexecute::Config;
/// let config = Config::from_json(r#"{ "use_dask": true, "n_workers": 4 }"#).unwrap();
/// assert!(config.deferred);
/// assert_eq!(config.n_workers, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record calls into a task graph and run them on a worker pool.
    #[serde(alias = "use_dask")]
    pub deferred: bool,
    /// Number of worker threads in the pool.
    pub n_workers: usize,
    /// Memory budget per worker in bytes.
    ///
    /// Only recorded and reported through [`Client::memory_limit`]. Workers
    /// are threads sharing the process heap, so nothing bounds their usage.
    ///
    /// [`Client::memory_limit`]: crate::Client::memory_limit
    pub memory_limit: Option<u64>,
    /// Prefix used to name worker threads.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deferred: true,
            n_workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            memory_limit: None,
            thread_name: "arl-worker".into(),
        }
    }
}

impl Config {
    /// Configuration running every call in place.
    pub fn sync() -> Self {
        Self {
            deferred: false,
            ..Self::default()
        }
    }

    /// Configuration building task graphs that run on a local worker pool.
    pub fn deferred() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn from_json(text: &str) -> Result<Self, ExecError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn mode(&self) -> Mode {
        if self.deferred {
            Mode::Deferred
        } else {
            Mode::Sync
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ExecError> {
        if self.deferred && self.n_workers == 0 {
            return Err(ExecError::Config(
                "`n_workers` must be at least 1 in deferred mode".into(),
            ));
        }

        if self.memory_limit == Some(0) {
            return Err(ExecError::Config("`memory_limit` must be positive".into()));
        }

        Ok(())
    }
}
