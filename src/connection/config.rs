use super::ShardConnection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a connection may be handed out or recycled.
pub type ConnectionCheck = Arc<dyn Fn(&dyn ShardConnection) -> bool + Send + Sync>;

/// Shard connection pool configuration
///
/// Mirrors the knobs of a classic Postgres pool: bounds, lifetimes and the
/// background health check period.
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in pool
    pub max_conns: usize,

    /// Number of connections the health check keeps open
    pub min_conns: usize,

    /// Connections older than this are destroyed instead of recycled
    pub max_conn_lifetime: Duration,

    /// Idle connections unused for this long are destroyed
    pub max_conn_idle_time: Duration,

    /// Interval of the background health check
    pub health_check_period: Duration,

    /// Skip the eager connection attempt at pool construction
    pub lazy_connect: bool,

    /// Upper bound for opening one connection from the health check
    pub create_timeout: Duration,

    /// Upper bound for closing one connection on pool close
    pub close_grace_period: Duration,

    /// Called on an idle connection before it is handed out; `false` destroys it
    pub before_acquire: Option<ConnectionCheck>,

    /// Called after release; `false` destroys the connection
    pub after_release: Option<ConnectionCheck>,
}

impl PoolConfig {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            max_conns: cpus.max(4),
            min_conns: 0,
            max_conn_lifetime: Duration::from_secs(60 * 60),
            max_conn_idle_time: Duration::from_secs(30 * 60),
            health_check_period: Duration::from_secs(60),
            lazy_connect: false,
            create_timeout: Duration::from_secs(60),
            close_grace_period: Duration::from_secs(15),
            before_acquire: None,
            after_release: None,
        }
    }

    /// Set maximum connections
    pub fn max_conns(mut self, max: usize) -> Self {
        self.max_conns = max;
        self
    }

    /// Set minimum connections
    pub fn min_conns(mut self, min: usize) -> Self {
        self.min_conns = min;
        self
    }

    /// Set maximum lifetime
    pub fn max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_conn_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn max_conn_idle_time(mut self, idle: Duration) -> Self {
        self.max_conn_idle_time = idle;
        self
    }

    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    pub fn lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    pub fn before_acquire<F>(mut self, check: F) -> Self
    where
        F: Fn(&dyn ShardConnection) -> bool + Send + Sync + 'static,
    {
        self.before_acquire = Some(Arc::new(check));
        self
    }

    pub fn after_release<F>(mut self, check: F) -> Self
    where
        F: Fn(&dyn ShardConnection) -> bool + Send + Sync + 'static,
    {
        self.after_release = Some(Arc::new(check));
        self
    }

    /// Apply `pool_*` connection-string parameters
    ///
    /// Recognised keys: `pool_max_conns`, `pool_min_conns`,
    /// `pool_max_conn_lifetime`, `pool_max_conn_idle_time`,
    /// `pool_health_check_period`. Durations accept `ms`, `s`, `m` and `h`
    /// suffixes.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardproxy::PoolConfig;
    ///
    /// let config = PoolConfig::new()
    ///     .apply_params([("pool_max_conns", "8"), ("pool_max_conn_lifetime", "250ms")])
    ///     .unwrap();
    /// assert_eq!(config.max_conns, 8);
    /// ```
    pub fn apply_params<'a, I>(mut self, params: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in params {
            match key {
                "pool_max_conns" => {
                    let n: usize = value
                        .parse()
                        .map_err(|e| format!("cannot parse pool_max_conns: {}", e))?;
                    if n < 1 {
                        return Err(format!("pool_max_conns too small: {}", n));
                    }
                    self.max_conns = n;
                }
                "pool_min_conns" => {
                    self.min_conns = value
                        .parse()
                        .map_err(|e| format!("cannot parse pool_min_conns: {}", e))?;
                }
                "pool_max_conn_lifetime" => {
                    self.max_conn_lifetime = parse_duration(value)
                        .map_err(|e| format!("invalid pool_max_conn_lifetime: {}", e))?;
                }
                "pool_max_conn_idle_time" => {
                    self.max_conn_idle_time = parse_duration(value)
                        .map_err(|e| format!("invalid pool_max_conn_idle_time: {}", e))?;
                }
                "pool_health_check_period" => {
                    self.health_check_period = parse_period(value)
                        .map_err(|e| format!("invalid pool_health_check_period: {}", e))?;
                }
                other => return Err(format!("unknown pool parameter '{}'", other)),
            }
        }
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be > 0".to_string());
        }

        if self.min_conns > self.max_conns {
            return Err("min_conns cannot exceed max_conns".to_string());
        }

        if self.health_check_period.is_zero() {
            return Err("health_check_period must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_conns", &self.max_conns)
            .field("min_conns", &self.min_conns)
            .field("max_conn_lifetime", &self.max_conn_lifetime)
            .field("max_conn_idle_time", &self.max_conn_idle_time)
            .field("health_check_period", &self.health_check_period)
            .field("lazy_connect", &self.lazy_connect)
            .field("create_timeout", &self.create_timeout)
            .field("close_grace_period", &self.close_grace_period)
            .field("before_acquire", &self.before_acquire.is_some())
            .field("after_release", &self.after_release.is_some())
            .finish()
    }
}

/// Parse a duration such as `250ms`, `30s`, `5m` or `1h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
    let (digits, unit) = input.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;

    let seconds = |scale: u64| {
        amount
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{}' is too large", input))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        _ => Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
    }
}

/// Parse a ticker period; like [`parse_duration`] but zero is rejected.
pub fn parse_period(input: &str) -> Result<Duration, String> {
    let period = parse_duration(input)?;
    if period.is_zero() {
        return Err(format!("period '{}' must be greater than zero", input.trim()));
    }
    Ok(period)
}
