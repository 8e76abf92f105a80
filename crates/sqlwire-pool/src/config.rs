//! Pool configuration.

use std::sync::Arc;
use std::time::Duration;

use sqlwire_core::{Error, Result};

use crate::metrics::{PoolObserver, TracingObserver};

/// Connection pool configuration.
///
/// Built once with the chained setters and handed to [`Pool::new`]; the
/// pool never changes it afterwards.
///
/// [`Pool::new`]: crate::Pool::new
#[derive(Clone)]
pub struct PoolConfig {
    /// Idle connections the reaper keeps open
    pub min_idle: usize,
    /// Upper bound on open connections, idle and in use together
    pub max_size: usize,
    /// How long `acquire` waits before failing with a timeout
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed (down to `min_idle`)
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed regardless of `min_idle`
    pub max_lifetime: Option<Duration>,
    /// Warn once when a connection is held longer than this
    pub leak_detection_threshold: Option<Duration>,
    /// Period of the background reaper; `None` disables the thread
    pub reaper_interval: Option<Duration>,
    /// Ping every idle connection before handing it out
    pub test_on_checkout: bool,
    /// Run `reset_session` on connections coming back to the pool
    pub reset_on_release: bool,
    /// Ping connections that sat idle at least this long, even when
    /// `test_on_checkout` is off
    pub validation_idle_threshold: Duration,
    /// Capture a full backtrace at acquisition for leak reports
    pub capture_backtrace: bool,
    pub(crate) observer: Arc<dyn PoolObserver>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            leak_detection_threshold: None,
            reaper_interval: Some(Duration::from_secs(30)),
            test_on_checkout: false,
            reset_on_release: true,
            validation_idle_threshold: Duration::from_secs(5),
            capture_backtrace: false,
            observer: Arc::new(TracingObserver),
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_idle", &self.min_idle)
            .field("max_size", &self.max_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("leak_detection_threshold", &self.leak_detection_threshold)
            .field("reaper_interval", &self.reaper_interval)
            .field("test_on_checkout", &self.test_on_checkout)
            .field("reset_on_release", &self.reset_on_release)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    /// Create a configuration with the given max size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    pub fn min_idle(mut self, n: usize) -> Self {
        self.min_idle = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn leak_detection_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.leak_detection_threshold = threshold;
        self
    }

    pub fn reaper_interval(mut self, interval: Option<Duration>) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    pub fn reset_on_release(mut self, enabled: bool) -> Self {
        self.reset_on_release = enabled;
        self
    }

    pub fn validation_idle_threshold(mut self, threshold: Duration) -> Self {
        self.validation_idle_threshold = threshold;
        self
    }

    pub fn capture_backtrace(mut self, enabled: bool) -> Self {
        self.capture_backtrace = enabled;
        self
    }

    /// Replace the default [`TracingObserver`].
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Check that the settings are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("max_size must be at least 1"));
        }
        if self.min_idle > self.max_size {
            return Err(Error::config(format!(
                "min_idle ({}) exceeds max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::config("acquire_timeout must be positive"));
        }
        let zero = |d: Option<Duration>| d.is_some_and(|d| d.is_zero());
        if zero(self.idle_timeout) || zero(self.max_lifetime) {
            return Err(Error::config("idle_timeout and max_lifetime must be positive"));
        }
        if zero(self.leak_detection_threshold) {
            return Err(Error::config("leak_detection_threshold must be positive"));
        }
        if zero(self.reaper_interval) {
            return Err(Error::config("reaper_interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 10);
        assert!(config.reset_on_release);
        config.validate().unwrap();
    }

    #[test]
    fn builder_chain() {
        let config = PoolConfig::new(4)
            .min_idle(2)
            .acquire_timeout(Duration::from_millis(250))
            .idle_timeout(None)
            .leak_detection_threshold(Some(Duration::from_secs(2)))
            .test_on_checkout(true);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_idle, 2);
        assert_eq!(config.idle_timeout, None);
        assert!(config.test_on_checkout);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let err = PoolConfig::new(2).min_idle(3).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("min_idle"));

        assert!(PoolConfig::new(0).validate().is_err());
        assert!(
            PoolConfig::new(1)
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new(1)
                .reaper_interval(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
    }
}
