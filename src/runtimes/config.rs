use std::time::Duration;

use crate::schedulers::RetryPolicy;

/// Tuning knobs for the engine runtime.
///
/// All fields have working defaults; `with_*` methods override them
/// piecemeal. The sweeper interval is orthogonal to correctness — it only
/// bounds how quickly stuck attempts are reclaimed and due schedules fire.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How often the background sweeper ticks.
    pub sweep_interval: Duration,
    /// Number of dispatcher workers.
    pub worker_pool_size: usize,
    /// Claim deadline for attempts without a per-node override.
    pub default_attempt_timeout: Duration,
    /// Retry budget per node without a per-node override.
    pub max_attempts: u32,
    /// Base of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub backoff_cap: Duration,
    /// Database name used by SQLite-backed engines; resolved from the
    /// `TRELLIS_SQLITE_DB` environment variable when unset.
    pub sqlite_db_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            worker_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            default_attempt_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
        }
    }
}

impl EngineConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if provided.is_some() {
            return provided;
        }
        dotenvy::dotenv().ok();
        std::env::var("TRELLIS_SQLITE_DB").ok()
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_default_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.default_attempt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    #[must_use]
    pub fn with_sqlite_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = Some(name.into());
        self
    }

    /// The default retry policy; per-node overrides apply on top.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
        }
    }
}
