use std::time::Duration;

/// Per-client tuning for monitoring, selection and retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conventions {
    connect_timeout: Duration,
    disable_topology_updates: bool,
    heartbeat_frequency: Duration,
    local_threshold: Duration,
    max_retries: u32,
    reroute_to_primary: bool,
    retry_backoff: Duration,
    /// Upper bound for one command round trip on an operation connection
    socket_timeout: Duration,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disable_topology_updates: false,
            heartbeat_frequency: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
            max_retries: 3,
            reroute_to_primary: true,
            retry_backoff: Duration::from_secs(2),
            socket_timeout: Duration::from_secs(30),
        }
    }
}

// Mutators
impl Conventions {
    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Stops the background heartbeat. Scans then only happen on demand and
    /// after failed operations.
    pub fn set_disable_topology_updates(mut self, disable: bool) -> Self {
        self.disable_topology_updates = disable;
        self
    }

    pub fn set_heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.heartbeat_frequency = frequency;
        self
    }

    pub fn set_local_threshold(mut self, threshold: Duration) -> Self {
        self.local_threshold = threshold;
        self
    }

    pub fn set_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn set_reroute_to_primary(mut self, reroute: bool) -> Self {
        self.reroute_to_primary = reroute;
        self
    }

    pub fn set_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn set_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }
}

// Getters
impl Conventions {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn disable_topology_updates(&self) -> bool {
        self.disable_topology_updates
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn reroute_to_primary(&self) -> bool {
        self.reroute_to_primary
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }
}
