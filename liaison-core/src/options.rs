//! Protocol tuning options
//!
//! Timing and binding knobs shared by every protocol object. A transport
//! context carries one set of defaults; each protocol object can override
//! them before `init`.

use std::time::Duration;

/// Protocol configuration options.
///
/// # Examples
///
/// ```
/// use liaison_core::options::ProtocolOptions;
/// use std::time::Duration;
///
/// let opts = ProtocolOptions::default()
///     .with_timeout(Duration::from_secs(2))
///     .with_polling_interval(Duration::from_millis(20));
/// assert_eq!(opts.poll_iterations(), Some(101));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// Per-iteration wait of every polling receive loop.
    ///
    /// Bounds how long a blocked loop takes to notice a cancel flag.
    /// - Default: 100ms
    pub polling_interval: Duration,

    /// Receive deadline of requesters and subscribers.
    ///
    /// - `None`: wait forever (default)
    /// - `Some(duration)`: give up after `duration` and flag the timeout
    pub timeout: Option<Duration>,

    /// Readiness handshake step.
    ///
    /// The first SYNC attempt waits this long; every retry waits one more
    /// step than the previous one.
    /// - Default: 200ms
    pub sync_timeout_step: Duration,

    /// Socket linger (ZMQ_LINGER)
    ///
    /// Time a destroyed socket keeps trying to flush pending messages.
    /// - Default: 0 so that destroying a socket never blocks
    pub linger: Duration,

    /// Host part used when binding leased TCP ports.
    ///
    /// - Default: `*` (all interfaces)
    pub bind_host: String,

    /// Whether subscribers follow the status topic of the publishing application.
    ///
    /// - Default: true
    pub check_app: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(100),
            timeout: None,
            sync_timeout_step: Duration::from_millis(200),
            linger: Duration::ZERO,
            bind_host: "*".to_string(),
            check_app: true,
        }
    }
}

impl ProtocolOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// `Duration::ZERO` means no deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    #[must_use]
    pub fn with_sync_timeout_step(mut self, step: Duration) -> Self {
        self.sync_timeout_step = step;
        self
    }

    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    #[must_use]
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    #[must_use]
    pub fn with_check_app(mut self, check: bool) -> Self {
        self.check_app = check;
        self
    }

    /// Number of polling iterations that fit in the timeout, or `None` to poll forever.
    pub fn poll_iterations(&self) -> Option<u64> {
        poll_iterations(self.timeout, self.polling_interval)
    }

    /// Polling interval in milliseconds, as expected by `zmq_poll`.
    pub fn polling_millis(&self) -> i64 {
        i64::try_from(self.polling_interval.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn linger_millis(&self) -> i32 {
        i32::try_from(self.linger.as_millis()).unwrap_or(i32::MAX)
    }

    /// TCP bind address of a leased port.
    pub fn bind_address(&self, port: u16) -> String {
        format!("tcp://{}:{}", self.bind_host, port)
    }
}

/// `timeout / interval + 1` iterations, or `None` when there is no timeout.
pub fn poll_iterations(timeout: Option<Duration>, interval: Duration) -> Option<u64> {
    let timeout = timeout?;
    let interval = interval.as_millis().max(1);
    Some(u64::try_from(timeout.as_millis() / interval).unwrap_or(u64::MAX) + 1)
}
