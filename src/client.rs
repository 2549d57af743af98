use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::{Config, Mode};
use crate::error::ExecError;

/// A configured execution session.
///
/// In deferred mode the client owns a rayon thread pool sized by
/// [`Config::n_workers`]; in sync mode it owns nothing and every call runs on
/// the caller's thread. A client lives from `set_client` until `close`;
/// computations still holding it after `close` observe the cancellation flag
/// and wind down.
pub struct Client {
    config: Config,
    pool: Option<ThreadPool>,
    cancelled: Arc<AtomicBool>,
    started: Instant,
}

impl Client {
    pub(crate) fn start(config: Config) -> Result<Self, ExecError> {
        config.validate()?;

        let pool = match config.mode() {
            Mode::Sync => None,
            Mode::Deferred => {
                let prefix = config.thread_name.clone();
                let pool = ThreadPoolBuilder::new()
                    .num_threads(config.n_workers)
                    .thread_name(move |i| format!("{prefix}-{i}"))
                    .build()?;
                Some(pool)
            }
        };

        if let Some(limit) = config.memory_limit {
            tracing::debug!(
                limit,
                "memory limit recorded per worker, threads share the process heap"
            );
        }

        Ok(Self {
            config,
            pool,
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.config.mode()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of workers executing tasks; zero in sync mode.
    pub fn n_workers(&self) -> usize {
        self.pool
            .as_ref()
            .map(ThreadPool::current_num_threads)
            .unwrap_or(0)
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.config.memory_limit
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub(crate) fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    /// The flag tasks check before and after running; tasks spawned on the
    /// pool keep their own handle so they can outlive the coordinator.
    pub(crate) fn cancelled(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Runs `func` once on every worker, or once in place in sync mode.
    pub(crate) fn broadcast<R, F>(&self, func: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.broadcast(|ctx| func(ctx.index())),
            None => vec![func(0)],
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.mode())
            .field("n_workers", &self.n_workers())
            .field("memory_limit", &self.config.memory_limit)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
