use std::time::Duration;

/// Configuration for the wsrpc client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint authority and path without a scheme,
    /// e.g. "localhost:8080/kafka/ws". The scheme pair is chosen by
    /// `secure`.
    pub endpoint: String,

    /// Use wss/https instead of ws/http.
    pub secure: bool,

    /// Skip the persistent socket entirely and poll the stateless
    /// transport from the start.
    pub disable_websocket: bool,

    /// Websocket handshake timeout.
    pub connect_timeout: Duration,

    /// First reconnect delay after a socket loss.
    pub reconnect_floor: Duration,

    /// Upper bound on the reconnect delay.
    pub reconnect_ceiling: Duration,

    /// Multiplicative backoff growth per failed attempt.
    pub reconnect_factor: u32,

    /// Length of one transport-error sampling window.
    pub error_window: Duration,

    /// Errors per window above which the socket is permanently abandoned
    /// in favor of the stateless transport.
    pub error_threshold: u32,

    /// Stateless retry cadence while degraded.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(), // Must be set by user
            secure: false,
            disable_websocket: false,
            connect_timeout: Duration::from_secs(10),
            reconnect_floor: Duration::from_millis(10),
            reconnect_ceiling: Duration::from_secs(10),
            reconnect_factor: 10,
            error_window: Duration::from_secs(5),
            error_threshold: 10,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Create a new config for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Choose wss/https over ws/http.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Administratively disable the persistent socket.
    pub fn with_websocket_disabled(mut self, disabled: bool) -> Self {
        self.disable_websocket = disabled;
        self
    }

    /// Set the websocket handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect backoff floor, ceiling and growth factor.
    pub fn with_reconnect_backoff(mut self, floor: Duration, ceiling: Duration, factor: u32) -> Self {
        self.reconnect_floor = floor;
        self.reconnect_ceiling = ceiling;
        self.reconnect_factor = factor;
        self
    }

    /// Set the error sampling window and degradation threshold.
    pub fn with_error_sampling(mut self, window: Duration, threshold: u32) -> Self {
        self.error_window = window;
        self.error_threshold = threshold;
        self
    }

    /// Set the stateless retry cadence used while degraded.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
