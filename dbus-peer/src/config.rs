//! Connection configuration, built fluently via a `&mut self -> &mut Self`
//! chain covering the full set of timeouts, reconnection, and health-check
//! knobs the connection lifecycle needs.

use std::time::Duration;

use crate::sasl::{Anonymous, CookieSha1, External, Mechanism};

/// Which `SASL` mechanism to offer, in preference order.
///
/// A plain enum rather than trait objects up front, so [`Config`] stays
/// `Clone` and constructing a fresh `Mechanism` per connection attempt
/// (required since the trait's state is consumed across one handshake) is
/// just a match away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanismKind {
    /// `EXTERNAL`, authenticating with the transport's ancillary UID.
    External,
    /// `DBUS_COOKIE_SHA1`, the shared-secret keyring challenge.
    CookieSha1,
    /// `ANONYMOUS`, no credentials at all.
    Anonymous,
}

impl SaslMechanismKind {
    pub(crate) fn build(self) -> Box<dyn Mechanism> {
        match self {
            Self::External => Box::new(External),
            Self::CookieSha1 => Box::new(CookieSha1::new()),
            Self::Anonymous => Box::new(Anonymous),
        }
    }
}

/// Tunables for a [`crate::connection::Connection`].
///
/// Constructed via [`Config::new`] and the fluent `&mut self -> &mut Self`
/// setters rather than a struct-literal-with-`..Default::default()`
/// pattern.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) connect_timeout: Duration,
    pub(crate) method_call_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) close_timeout: Duration,
    pub(crate) auto_reconnect_enabled: bool,
    pub(crate) reconnect_initial_delay: Duration,
    pub(crate) reconnect_max_delay: Duration,
    pub(crate) reconnect_backoff_multiplier: f64,
    pub(crate) reconnect_jitter: f64,
    pub(crate) health_check_enabled: bool,
    pub(crate) health_check_interval: Duration,
    pub(crate) max_consecutive_health_failures: u32,
    pub(crate) allow_unix_fd: bool,
    pub(crate) sasl_mechanisms: Vec<SaslMechanismKind>,
    pub(crate) worker_pool_size: usize,
}

impl Config {
    /// Construct a config with its documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// How long [`crate::connection::Connection::connect`] waits for the
    /// transport to dial and the `SASL` handshake plus `Hello` call to
    /// complete. Default 10s.
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long [`crate::connection::Connection::send_request`] waits for a
    /// correlated reply before failing with `Timeout`. Default 30s.
    pub fn method_call_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.method_call_timeout = timeout;
        self
    }

    /// Per-read deadline on the transport, if any. Default: none.
    pub fn read_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.read_timeout = timeout;
        self
    }

    /// Per-write deadline on the transport, if any. Default: none.
    pub fn write_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.write_timeout = timeout;
        self
    }

    /// How long [`crate::connection::Connection::close`] waits for the I/O
    /// task to drain before it is aborted outright. Default 5s.
    pub fn close_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.close_timeout = timeout;
        self
    }

    /// Whether a stream-level failure moves the connection to `DEGRADED`
    /// and schedules reconnection, rather than straight to `CLOSED`.
    /// Default `false`.
    pub fn auto_reconnect(&mut self, enabled: bool) -> &mut Self {
        self.auto_reconnect_enabled = enabled;
        self
    }

    /// The first reconnect delay, before exponential backoff applies.
    /// Default 500ms.
    pub fn reconnect_initial_delay(&mut self, delay: Duration) -> &mut Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// The ceiling backoff grows toward. Default 30s.
    pub fn reconnect_max_delay(&mut self, delay: Duration) -> &mut Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// The multiplier applied to the delay after each failed attempt.
    /// Default `2.0`.
    pub fn reconnect_backoff_multiplier(&mut self, multiplier: f64) -> &mut Self {
        self.reconnect_backoff_multiplier = multiplier;
        self
    }

    /// Fractional jitter applied to each computed delay, as a proportion of
    /// the delay (`0.2` means ±20%). Default `0.2`.
    pub fn reconnect_jitter(&mut self, jitter: f64) -> &mut Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Whether a periodic `org.freedesktop.DBus.Peer.Ping` is sent while
    /// `ACTIVE`. Default `false`.
    pub fn health_check(&mut self, enabled: bool) -> &mut Self {
        self.health_check_enabled = enabled;
        self
    }

    /// The interval between health-check pings. Default 15s.
    pub fn health_check_interval(&mut self, interval: Duration) -> &mut Self {
        self.health_check_interval = interval;
        self
    }

    /// Consecutive health-check failures tolerated before the connection is
    /// treated as failed and moved to `DEGRADED`. Default `3`.
    pub fn max_consecutive_health_failures(&mut self, count: u32) -> &mut Self {
        self.max_consecutive_health_failures = count;
        self
    }

    /// Whether to negotiate `UNIX_FDS` passing during `SASL`, when the
    /// transport supports it. Default `false`.
    pub fn allow_unix_fd(&mut self, allow: bool) -> &mut Self {
        self.allow_unix_fd = allow;
        self
    }

    /// The ordered list of `SASL` mechanisms to offer. Default
    /// `[External, CookieSha1, Anonymous]`.
    pub fn sasl_mechanisms(&mut self, mechanisms: Vec<SaslMechanismKind>) -> &mut Self {
        self.sasl_mechanisms = mechanisms;
        self
    }

    /// Number of worker tasks draining the pipeline's event queue. Default
    /// `min(available_parallelism / 2, 2)`.
    pub fn worker_pool_size(&mut self, size: usize) -> &mut Self {
        self.worker_pool_size = size.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            connect_timeout: Duration::from_secs(10),
            method_call_timeout: Duration::from_secs(30),
            read_timeout: None,
            write_timeout: None,
            close_timeout: Duration::from_secs(5),
            auto_reconnect_enabled: false,
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_multiplier: 2.0,
            reconnect_jitter: 0.2,
            health_check_enabled: false,
            health_check_interval: Duration::from_secs(15),
            max_consecutive_health_failures: 3,
            allow_unix_fd: false,
            sasl_mechanisms: vec![
                SaslMechanismKind::External,
                SaslMechanismKind::CookieSha1,
                SaslMechanismKind::Anonymous,
            ],
            worker_pool_size: (cpus / 2).max(1).min(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::new();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.method_call_timeout, Duration::from_secs(30));
        assert!(!config.auto_reconnect_enabled);
        assert_eq!(config.worker_pool_size.clamp(1, 2), config.worker_pool_size);
    }

    #[test]
    fn builder_overrides_stick() {
        let mut config = Config::new();
        config
            .auto_reconnect(true)
            .method_call_timeout(Duration::from_secs(5))
            .sasl_mechanisms(vec![SaslMechanismKind::Anonymous]);

        assert!(config.auto_reconnect_enabled);
        assert_eq!(config.method_call_timeout, Duration::from_secs(5));
        assert_eq!(config.sasl_mechanisms, vec![SaslMechanismKind::Anonymous]);
    }
}
