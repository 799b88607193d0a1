//! Client configuration types and builders.

use std::time::Duration;

use url::Url;

/// Default bootstrap URI when none is configured.
const DEFAULT_BOOTSTRAP_URI: &str = "http://localhost:8091";
/// Default per-node pool lower bound.
const DEFAULT_POOL_MIN_SIZE: usize = 1;
/// Default per-node pool upper bound.
const DEFAULT_POOL_MAX_SIZE: usize = 2;
/// Default wait for a pooled connection before giving up.
const DEFAULT_POOL_WAIT_TIMEOUT: Duration = Duration::from_millis(2500);
/// Default grace period for draining a pool on shutdown.
const DEFAULT_POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for a key/value operation.
const DEFAULT_OPERATION_LIFESPAN: Duration = Duration::from_millis(2500);
/// Default base backoff after a stale-partition response.
const DEFAULT_VBUCKET_RETRY_SLEEP: Duration = Duration::from_millis(100);
/// Default deadline for view requests.
const DEFAULT_VIEW_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);
/// Default deadline for N1QL requests.
const DEFAULT_QUERY_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);
/// Default deadline for full-text search requests.
const DEFAULT_SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);
/// Default deadline for analytics requests.
const DEFAULT_ANALYTICS_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);
/// Transport errors tolerated within the check interval before quarantine.
const DEFAULT_IO_ERROR_THRESHOLD: u32 = 10;
/// Rolling window for transport error counting.
const DEFAULT_IO_ERROR_CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// HTTP failures tolerated before a service URI is retired.
const DEFAULT_QUERY_FAILED_THRESHOLD: u32 = 2;
/// Default topology poll cadence.
const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(2500);
/// Lower bound on topology poll cadence.
const DEFAULT_CONFIG_POLL_CHECK_FLOOR: Duration = Duration::from_millis(50);
/// Default TCP keep-alive idle time.
const DEFAULT_TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(60);
/// Default TCP keep-alive probe interval.
const DEFAULT_TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Credentials for a bucket that authenticates with its own password.
#[derive(Debug, Clone)]
pub struct BucketCredentials {
    name: String,
    password: Option<String>,
}

impl BucketCredentials {
    /// Creates credentials for the named bucket.
    pub fn new(name: impl Into<String>, password: Option<String>) -> Self {
        Self {
            name: name.into(),
            password,
        }
    }

    /// Returns the bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the bucket password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

/// Bounds and timeouts for the per-node connection pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    min_size: usize,
    max_size: usize,
    wait_timeout: Duration,
    shutdown_timeout: Duration,
}

impl PoolConfig {
    /// Returns the minimum number of connections kept per node.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Returns the maximum number of connections opened per node.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns how long an acquire blocks before failing.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Returns the grace period for draining in-flight work on disposal.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            wait_timeout: DEFAULT_POOL_WAIT_TIMEOUT,
            shutdown_timeout: DEFAULT_POOL_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    min_size: Option<usize>,
    max_size: Option<usize>,
    wait_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum number of connections kept per node.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = Some(min_size);
        self
    }

    /// Sets the maximum number of connections opened per node.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets how long an acquire blocks before failing.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Sets the grace period for draining in-flight work on disposal.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Builds the pool configuration.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let min_size = self.min_size.unwrap_or(DEFAULT_POOL_MIN_SIZE);
        let max_size = self.max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE);

        if max_size == 0 {
            return Err(ConfigError::new("pool max_size must be at least 1"));
        }
        if min_size > max_size {
            return Err(ConfigError::new(format!(
                "pool min_size ({}) exceeds max_size ({})",
                min_size, max_size
            )));
        }

        Ok(PoolConfig {
            min_size,
            max_size,
            wait_timeout: self.wait_timeout.unwrap_or(DEFAULT_POOL_WAIT_TIMEOUT),
            shutdown_timeout: self
                .shutdown_timeout
                .unwrap_or(DEFAULT_POOL_SHUTDOWN_TIMEOUT),
        })
    }
}

/// TCP keep-alive tuning applied at dial time.
#[derive(Debug, Clone)]
pub struct KeepAliveOptions {
    enabled: bool,
    time: Duration,
    interval: Duration,
}

impl KeepAliveOptions {
    /// Returns whether TCP keep-alives are enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the idle time before the first probe.
    pub fn time(&self) -> Duration {
        self.time
    }

    /// Returns the interval between probes.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for KeepAliveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            time: DEFAULT_TCP_KEEPALIVE_TIME,
            interval: DEFAULT_TCP_KEEPALIVE_INTERVAL,
        }
    }
}

/// TLS behavior, threaded to every TLS and HTTPS site.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    enable_certificate_authentication: bool,
    enable_certificate_revocation: bool,
    ignore_remote_certificate_name_mismatch: bool,
    certificate_path: Option<std::path::PathBuf>,
    private_key_path: Option<std::path::PathBuf>,
}

impl TlsOptions {
    /// Returns whether client certificate authentication is enabled.
    pub fn enable_certificate_authentication(&self) -> bool {
        self.enable_certificate_authentication
    }

    /// Returns whether certificate revocation checking is requested.
    pub fn enable_certificate_revocation(&self) -> bool {
        self.enable_certificate_revocation
    }

    /// Returns whether hostname mismatches on the peer certificate are ignored.
    pub fn ignore_remote_certificate_name_mismatch(&self) -> bool {
        self.ignore_remote_certificate_name_mismatch
    }

    /// Returns the client certificate path, if configured.
    pub fn certificate_path(&self) -> Option<&std::path::Path> {
        self.certificate_path.as_deref()
    }

    /// Returns the client private key path, if configured.
    pub fn private_key_path(&self) -> Option<&std::path::Path> {
        self.private_key_path.as_deref()
    }
}

/// Top-level client configuration.
///
/// Covers bootstrap, credentials, per-node pooling, HTTP deadlines, retry
/// tuning, topology polling, socket options and TLS behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    use_ssl: bool,
    servers: Vec<Url>,
    buckets: Vec<BucketCredentials>,
    username: Option<String>,
    password: Option<String>,
    pool: PoolConfig,
    view_request_timeout: Duration,
    query_request_timeout: Duration,
    search_request_timeout: Duration,
    analytics_request_timeout: Duration,
    operation_lifespan: Duration,
    vbucket_retry_sleep: Duration,
    io_error_threshold: u32,
    io_error_check_interval: Duration,
    query_failed_threshold: u32,
    config_poll_enabled: bool,
    config_poll_interval: Duration,
    config_poll_check_floor: Duration,
    keep_alive: KeepAliveOptions,
    force_sasl_plain: bool,
    tls: TlsOptions,
    use_connection_pooling: bool,
}

impl ClientConfig {
    /// Creates a configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns whether TLS is enabled on data and HTTP ports.
    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    /// Returns the bootstrap URIs.
    pub fn servers(&self) -> &[Url] {
        &self.servers
    }

    /// Returns the per-bucket credentials.
    pub fn buckets(&self) -> &[BucketCredentials] {
        &self.buckets
    }

    /// Returns the cluster-wide username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the cluster-wide password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Looks up the password configured for a bucket.
    pub fn bucket_password(&self, bucket: &str) -> Option<&str> {
        self.buckets
            .iter()
            .find(|b| b.name() == bucket)
            .and_then(|b| b.password())
    }

    /// Returns the pool bounds and timeouts.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Returns the view request deadline.
    pub fn view_request_timeout(&self) -> Duration {
        self.view_request_timeout
    }

    /// Returns the N1QL request deadline.
    pub fn query_request_timeout(&self) -> Duration {
        self.query_request_timeout
    }

    /// Returns the full-text search request deadline.
    pub fn search_request_timeout(&self) -> Duration {
        self.search_request_timeout
    }

    /// Returns the analytics request deadline.
    pub fn analytics_request_timeout(&self) -> Duration {
        self.analytics_request_timeout
    }

    /// Returns the default key/value operation deadline.
    pub fn operation_lifespan(&self) -> Duration {
        self.operation_lifespan
    }

    /// Returns the base backoff after a stale-partition response.
    pub fn vbucket_retry_sleep(&self) -> Duration {
        self.vbucket_retry_sleep
    }

    /// Returns the transport error count that quarantines a node.
    pub fn io_error_threshold(&self) -> u32 {
        self.io_error_threshold
    }

    /// Returns the rolling window for transport error counting.
    pub fn io_error_check_interval(&self) -> Duration {
        self.io_error_check_interval
    }

    /// Returns the HTTP failure count that retires a service URI.
    pub fn query_failed_threshold(&self) -> u32 {
        self.query_failed_threshold
    }

    /// Returns whether background topology polling is enabled.
    pub fn config_poll_enabled(&self) -> bool {
        self.config_poll_enabled
    }

    /// Returns the topology poll cadence.
    pub fn config_poll_interval(&self) -> Duration {
        self.config_poll_interval
    }

    /// Returns the lower bound on topology poll cadence.
    pub fn config_poll_check_floor(&self) -> Duration {
        self.config_poll_check_floor
    }

    /// Returns the TCP keep-alive tuning.
    pub fn keep_alive(&self) -> &KeepAliveOptions {
        &self.keep_alive
    }

    /// Returns whether SCRAM mechanisms are disabled.
    pub fn force_sasl_plain(&self) -> bool {
        self.force_sasl_plain
    }

    /// Returns the TLS behavior options.
    pub fn tls(&self) -> &TlsOptions {
        &self.tls
    }

    /// Returns `true` for the pooled IO service, `false` for multiplexed.
    pub fn use_connection_pooling(&self) -> bool {
        self.use_connection_pooling
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new()
            .build()
            .unwrap_or_else(|_| unreachable!("default configuration is valid"))
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    use_ssl: bool,
    servers: Vec<Url>,
    buckets: Vec<BucketCredentials>,
    username: Option<String>,
    password: Option<String>,
    pool: Option<PoolConfig>,
    view_request_timeout: Option<Duration>,
    query_request_timeout: Option<Duration>,
    search_request_timeout: Option<Duration>,
    analytics_request_timeout: Option<Duration>,
    operation_lifespan: Option<Duration>,
    vbucket_retry_sleep: Option<Duration>,
    io_error_threshold: Option<u32>,
    io_error_check_interval: Option<Duration>,
    query_failed_threshold: Option<u32>,
    config_poll_enabled: Option<bool>,
    config_poll_interval: Option<Duration>,
    config_poll_check_floor: Option<Duration>,
    keep_alive: Option<KeepAliveOptions>,
    force_sasl_plain: bool,
    tls: Option<TlsOptions>,
    use_connection_pooling: bool,
}

impl ClientConfigBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables TLS on all data and HTTP ports.
    ///
    /// When enabled, the client selects the SSL port set from the topology.
    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    /// Adds a bootstrap URI.
    pub fn add_server(mut self, server: Url) -> Self {
        self.servers.push(server);
        self
    }

    /// Sets the bootstrap URIs, replacing any previously configured.
    pub fn servers(mut self, servers: impl IntoIterator<Item = Url>) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }

    /// Adds per-bucket credentials.
    pub fn add_bucket(mut self, name: impl Into<String>, password: Option<String>) -> Self {
        self.buckets.push(BucketCredentials::new(name, password));
        self
    }

    /// Sets cluster-wide credentials for enhanced authentication.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the per-node pool configuration.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the view request deadline.
    pub fn view_request_timeout(mut self, timeout: Duration) -> Self {
        self.view_request_timeout = Some(timeout);
        self
    }

    /// Sets the N1QL request deadline.
    pub fn query_request_timeout(mut self, timeout: Duration) -> Self {
        self.query_request_timeout = Some(timeout);
        self
    }

    /// Sets the full-text search request deadline.
    pub fn search_request_timeout(mut self, timeout: Duration) -> Self {
        self.search_request_timeout = Some(timeout);
        self
    }

    /// Sets the analytics request deadline.
    pub fn analytics_request_timeout(mut self, timeout: Duration) -> Self {
        self.analytics_request_timeout = Some(timeout);
        self
    }

    /// Sets the default key/value operation deadline.
    pub fn operation_lifespan(mut self, lifespan: Duration) -> Self {
        self.operation_lifespan = Some(lifespan);
        self
    }

    /// Sets the base backoff after a stale-partition response.
    pub fn vbucket_retry_sleep(mut self, sleep: Duration) -> Self {
        self.vbucket_retry_sleep = Some(sleep);
        self
    }

    /// Sets the transport error count that quarantines a node.
    pub fn io_error_threshold(mut self, threshold: u32) -> Self {
        self.io_error_threshold = Some(threshold);
        self
    }

    /// Sets the rolling window for transport error counting.
    pub fn io_error_check_interval(mut self, interval: Duration) -> Self {
        self.io_error_check_interval = Some(interval);
        self
    }

    /// Sets the HTTP failure count that retires a service URI.
    pub fn query_failed_threshold(mut self, threshold: u32) -> Self {
        self.query_failed_threshold = Some(threshold);
        self
    }

    /// Enables or disables background topology polling.
    pub fn config_poll_enabled(mut self, enabled: bool) -> Self {
        self.config_poll_enabled = Some(enabled);
        self
    }

    /// Sets the topology poll cadence.
    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = Some(interval);
        self
    }

    /// Sets the lower bound on topology poll cadence.
    pub fn config_poll_check_floor(mut self, floor: Duration) -> Self {
        self.config_poll_check_floor = Some(floor);
        self
    }

    /// Sets TCP keep-alive tuning.
    pub fn keep_alive(mut self, enabled: bool, time: Duration, interval: Duration) -> Self {
        self.keep_alive = Some(KeepAliveOptions {
            enabled,
            time,
            interval,
        });
        self
    }

    /// Disables SCRAM, forcing SASL PLAIN.
    pub fn force_sasl_plain(mut self, force: bool) -> Self {
        self.force_sasl_plain = force;
        self
    }

    /// Sets TLS behavior options.
    pub fn tls_options(
        mut self,
        enable_certificate_authentication: bool,
        enable_certificate_revocation: bool,
        ignore_remote_certificate_name_mismatch: bool,
    ) -> Self {
        let mut tls = self.tls.unwrap_or_default();
        tls.enable_certificate_authentication = enable_certificate_authentication;
        tls.enable_certificate_revocation = enable_certificate_revocation;
        tls.ignore_remote_certificate_name_mismatch = ignore_remote_certificate_name_mismatch;
        self.tls = Some(tls);
        self
    }

    /// Sets the client certificate and key used when certificate
    /// authentication is enabled.
    pub fn client_certificate(
        mut self,
        certificate: impl Into<std::path::PathBuf>,
        private_key: impl Into<std::path::PathBuf>,
    ) -> Self {
        let mut tls = self.tls.unwrap_or_default();
        tls.certificate_path = Some(certificate.into());
        tls.private_key_path = Some(private_key.into());
        self.tls = Some(tls);
        self
    }

    /// Selects the pooled (`true`) or multiplexed (`false`) IO service.
    pub fn use_connection_pooling(mut self, pooled: bool) -> Self {
        self.use_connection_pooling = pooled;
        self
    }

    /// Builds the client configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let servers = if self.servers.is_empty() {
            vec![Url::parse(DEFAULT_BOOTSTRAP_URI)
                .map_err(|e| ConfigError::new(format!("default bootstrap URI: {}", e)))?]
        } else {
            self.servers
        };

        for server in &servers {
            if server.host_str().is_none() {
                return Err(ConfigError::new(format!(
                    "bootstrap URI {} has no host",
                    server
                )));
            }
        }

        let tls = self.tls.unwrap_or_default();
        if tls.enable_certificate_authentication
            && (tls.certificate_path.is_none() || tls.private_key_path.is_none())
        {
            return Err(ConfigError::new(
                "certificate authentication requires a certificate and private key path",
            ));
        }

        Ok(ClientConfig {
            use_ssl: self.use_ssl,
            servers,
            buckets: self.buckets,
            username: self.username,
            password: self.password,
            pool: match self.pool {
                Some(pool) => pool,
                None => PoolConfig::default(),
            },
            view_request_timeout: self
                .view_request_timeout
                .unwrap_or(DEFAULT_VIEW_REQUEST_TIMEOUT),
            query_request_timeout: self
                .query_request_timeout
                .unwrap_or(DEFAULT_QUERY_REQUEST_TIMEOUT),
            search_request_timeout: self
                .search_request_timeout
                .unwrap_or(DEFAULT_SEARCH_REQUEST_TIMEOUT),
            analytics_request_timeout: self
                .analytics_request_timeout
                .unwrap_or(DEFAULT_ANALYTICS_REQUEST_TIMEOUT),
            operation_lifespan: self.operation_lifespan.unwrap_or(DEFAULT_OPERATION_LIFESPAN),
            vbucket_retry_sleep: self
                .vbucket_retry_sleep
                .unwrap_or(DEFAULT_VBUCKET_RETRY_SLEEP),
            io_error_threshold: self.io_error_threshold.unwrap_or(DEFAULT_IO_ERROR_THRESHOLD),
            io_error_check_interval: self
                .io_error_check_interval
                .unwrap_or(DEFAULT_IO_ERROR_CHECK_INTERVAL),
            query_failed_threshold: self
                .query_failed_threshold
                .unwrap_or(DEFAULT_QUERY_FAILED_THRESHOLD),
            config_poll_enabled: self.config_poll_enabled.unwrap_or(true),
            config_poll_interval: self
                .config_poll_interval
                .unwrap_or(DEFAULT_CONFIG_POLL_INTERVAL),
            config_poll_check_floor: self
                .config_poll_check_floor
                .unwrap_or(DEFAULT_CONFIG_POLL_CHECK_FLOOR),
            keep_alive: self.keep_alive.unwrap_or_default(),
            force_sasl_plain: self.force_sasl_plain,
            tls,
            use_connection_pooling: self.use_connection_pooling,
        })
    }
}
