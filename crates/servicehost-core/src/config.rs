//! Centralized configuration for the service host.
//!
//! Policy values live here as associated constants. Runtime option structs
//! (`BackoffPolicy`, `SessionOptions`, `ManagerOptions`) default to them.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "servicehost";
    /// Protocol version reported by the harness in its `loaded` handshake.
    pub const API_VERSION: i64 = 5;
    pub const DEFAULT_LOG_LEVEL: &'static str = "info";
}

/// Framed transport configuration.
pub struct IpcConfig;

impl IpcConfig {
    /// Maximum payload bytes in a single frame.
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
    /// Initial capacity of the per-connection receive buffer.
    pub const READ_BUFFER_INITIAL: usize = 4096;
    /// Prefix of ephemeral rendezvous addresses.
    pub const EPHEMERAL_PREFIX: &'static str = "servicehost-";
    /// First transaction id issued by a process.
    pub const FIRST_TRANSACTION_ID: u32 = 1000;
}

/// Process controller configuration.
pub struct ControllerConfig;

impl ControllerConfig {
    /// How often a spawned process is checked for premature exit while no
    /// channel is connected yet.
    pub const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(200);
    /// Maximum number of services spawned at once to extract descriptions.
    pub const MAX_CONCURRENT_DESCRIBES: usize = 4;
    /// Upper bound on a single describe round trip during a disk scan.
    pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(20);
    /// Default uri given to allocations that carry none.
    pub const UNKNOWN_CLIENT_URI: &'static str = "bpclient://unknown";
}

/// Dynamic service state configuration.
pub struct ServiceStateConfig;

impl ServiceStateConfig {
    /// Added to the soonest idle deadline before the idle check fires.
    pub const IDLE_CHECK_MARGIN: Duration = Duration::from_millis(100);
    /// First id handed out by `DynamicServiceManager::instantiate`.
    pub const FIRST_INSTANTIATE_ID: u32 = 10000;
}

/// Client session creation configuration.
pub struct SessionConfig;

impl SessionConfig {
    pub const INITIAL_POLL_PERIOD: Duration = Duration::from_millis(20);
    pub const POLL_GROWTH_RATE: f64 = 1.8;
    pub const MAX_POLL_PERIOD: Duration = Duration::from_millis(500);
    pub const MAX_WAIT: Duration = Duration::from_secs(20);
    /// Exit status a daemon uses to report that its version is blacklisted.
    pub const KILLSWITCH_EXIT_CODE: i32 = 42;
    pub const CREATE_SESSION_COMMAND: &'static str = "CreateSession";
}

/// Directory and file name configuration.
pub struct PathsConfig;

impl PathsConfig {
    pub const MANIFEST_FILE_NAME: &'static str = "manifest.json";
    pub const INSTALLED_MARKER: &'static str = "installed";
    pub const DISABLED_MARKER: &'static str = "disabled";
    pub const BLACKLISTED_MARKER: &'static str = "blacklisted";
    pub const KILLSWITCH_MARKER: &'static str = "killswitch";
    pub const DAEMON_SOCKET_NAME: &'static str = "servicehostd.sock";
    pub const SERVICES_DIR_NAME: &'static str = "services";
    pub const SERVICE_DATA_DIR_NAME: &'static str = "service-data";
    pub const INTERFACE_CACHE_DIR_NAME: &'static str = "interfaces";
    pub const TEMP_DIR_PREFIX: &'static str = "ServiceData";
}

/// Exponential backoff used while waiting for a freshly spawned daemon.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First poll period.
    pub initial: Duration,
    /// Multiplier applied after every poll.
    pub growth_rate: f64,
    /// Poll period cap.
    pub max_period: Duration,
    /// Overall deadline for the connect phase.
    pub deadline: Duration,
    /// Whether to randomize each period by up to +/-25%.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: SessionConfig::INITIAL_POLL_PERIOD,
            growth_rate: SessionConfig::POLL_GROWTH_RATE,
            max_period: SessionConfig::MAX_POLL_PERIOD,
            deadline: SessionConfig::MAX_WAIT,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_max_period(mut self, max_period: Duration) -> Self {
        self.max_period = max_period;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Poll period for the given attempt (0-indexed), capped at `max_period`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.growth_rate.powi(attempt as i32);
        let secs = (self.initial.as_secs_f64() * multiplier).min(self.max_period.as_secs_f64());

        let secs = if self.jitter {
            use rand::Rng;
            let factor = rand::rng().random_range(0.75..1.25);
            (secs * factor).min(self.max_period.as_secs_f64())
        } else {
            secs
        };

        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(20));
        let second = policy.calculate_delay(1);
        assert!(second > Duration::from_millis(35) && second < Duration::from_millis(37));
        assert_eq!(policy.calculate_delay(20), SessionConfig::MAX_POLL_PERIOD);
    }

    #[test]
    fn test_backoff_jitter_stays_under_cap() {
        let policy = BackoffPolicy::default().with_jitter(true);
        for attempt in 0..30 {
            assert!(policy.calculate_delay(attempt) <= SessionConfig::MAX_POLL_PERIOD);
        }
    }

    #[test]
    fn test_limits_are_reasonable() {
        assert_eq!(IpcConfig::MAX_MESSAGE_SIZE, 4_194_304);
        assert!(ServiceStateConfig::IDLE_CHECK_MARGIN < Duration::from_secs(1));
        assert!(SessionConfig::MAX_WAIT > SessionConfig::MAX_POLL_PERIOD);
    }
}
