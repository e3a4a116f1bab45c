use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// How new sessions are spread across the configured hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Cycle through the host list.
    #[default]
    RoundRobin,
    /// Pick a host uniformly at random.
    Random,
    /// Pick the host with the fewest live sessions.
    LeastConnections,
    /// Always try hosts in configured order.
    InOrder,
}

/// Transport encryption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain TCP only.
    #[default]
    Disabled,
    /// TLS with certificate verification against the system roots.
    Required,
    /// TLS without certificate verification.
    RequiredInsecure,
}

/// Options for establishing sessions to one logical server.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOptions {
    /// Candidate hosts; the load balancer picks among them per session.
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
    /// Negotiate the compressed protocol when the server supports it.
    #[serde(default)]
    pub compress: bool,
    /// Bound on socket + handshake establishment, separate from any
    /// command-level deadline.
    #[serde(default = "default_connect_timeout_ms", rename = "connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            hosts: vec![host.into()],
            port: default_port(),
            user: user.into(),
            password: String::new(),
            database: None,
            tls: TlsMode::Disabled,
            compress: false,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Normalized identity of this option set, used to key the pool
    /// registry. Hosts are order-significant (in-order balancing depends on
    /// it), everything else that affects session identity participates.
    /// Credentials count: the password enters as a digest so two option
    /// sets differing only in password never share a pool, without the
    /// password itself ending up in a map key.
    pub fn pool_key(&self) -> String {
        let password_digest = Sha256::digest(self.password.as_bytes());
        let pw: String = password_digest[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!(
            "{hosts}:{port}/{db}@{user}#{pw};tls={tls:?};compress={compress}",
            hosts = self.hosts.join(","),
            port = self.port,
            db = self.database.as_deref().unwrap_or(""),
            user = self.user,
            tls = self.tls,
            compress = self.compress,
        )
    }
}

/// Pooling limits and policies.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolOptions {
    /// Sessions the background reaper keeps ready.
    #[serde(default)]
    pub min_size: usize,
    /// Hard bound on leased + idle sessions.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle sessions older than this are closed by the reaper and never
    /// handed out by acquire.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Sessions past this age are closed on return or by the reaper.
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// Idle sessions unused for longer than this get a liveness ping before
    /// being handed out.
    #[serde(default = "default_ping_threshold_ms")]
    pub ping_threshold_ms: u64,
    /// Send COM_RESET_CONNECTION before requeueing a returned session.
    #[serde(default = "default_reset_on_return")]
    pub reset_on_return: bool,
    /// Per-session prepared statement cache capacity.
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
    #[serde(default)]
    pub load_balance: LoadBalancePolicy,
    /// Reaper sweep interval.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

fn default_port() -> u16 {
    3306
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_size() -> usize {
    10
}

fn default_idle_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_max_lifetime_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_ping_threshold_ms() -> u64 {
    10_000
}

fn default_reset_on_return() -> bool {
    true
}

fn default_statement_cache_capacity() -> usize {
    100
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            ping_threshold_ms: default_ping_threshold_ms(),
            reset_on_return: default_reset_on_return(),
            statement_cache_capacity: default_statement_cache_capacity(),
            load_balance: LoadBalancePolicy::default(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl PoolOptions {
    pub fn min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_ms = lifetime.as_millis() as u64;
        self
    }

    pub fn ping_threshold(mut self, threshold: Duration) -> Self {
        self.ping_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn reset_on_return(mut self, reset: bool) -> Self {
        self.reset_on_return = reset;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn load_balance(mut self, policy: LoadBalancePolicy) -> Self {
        self.load_balance = policy;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime_duration(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn ping_threshold_duration(&self) -> Duration {
        Duration::from_millis(self.ping_threshold_ms)
    }

    pub fn reap_interval_duration(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Top-level file configuration: connection options plus pool policy.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub connection: ConnectOptions,
    #[serde(default)]
    pub pool: PoolOptions,
}
