use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub enum Protocol {
    Http(u16), // port
    Tcp(u16),  // port
}

/// Settings for the memcached pool and the dispatcher sitting in front of it.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>,
    pub connections: usize,
    pub operation_timeout: Duration,
    pub task_check_interval: Duration,
    pub validate_on_connect: bool,
    pub query_workers: usize,
    pub query_timeout: Duration,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            servers: parse_servers(Config::DEFAULT_SERVERS),
            connections: 1,
            operation_timeout: Duration::from_millis(10_000),
            task_check_interval: Duration::from_millis(50),
            validate_on_connect: false,
            query_workers: 2,
            query_timeout: Duration::from_millis(1_000),
        }
    }
}

pub struct Config {
    pub host: String,
    pub http: Protocol,
    pub tcp: Protocol,
    pub address: String,
    pub bridge_reply_timeout: Duration,
    pub memcached: MemcachedConfig,
}

impl Config {
    const DEFAULT_HOST: &str = "127.0.0.1";
    const DEFAULT_ADDRESS: &str = "carbon.memcached";
    const DEFAULT_SERVERS: &str = "localhost:11211";

    pub fn from_env() -> Self {
        let defaults = MemcachedConfig::default();

        let memcached = MemcachedConfig {
            servers: std::env::var("CARBON_MEMCACHED_SERVERS")
                .map(|s| parse_servers(&s))
                .ok()
                .filter(|servers| !servers.is_empty())
                .unwrap_or(defaults.servers),
            connections: env_or("CARBON_MEMCACHED_CONNECTIONS", defaults.connections).max(1),
            operation_timeout: env_millis("CARBON_OPERATION_TIMEOUT_MS", defaults.operation_timeout),
            task_check_interval: env_millis("CARBON_TASK_CHECK_MS", defaults.task_check_interval),
            validate_on_connect: env_or("CARBON_VALIDATE_ON_CONNECT", defaults.validate_on_connect),
            query_workers: env_or("CARBON_QUERY_WORKERS", defaults.query_workers).max(1),
            query_timeout: env_millis("CARBON_QUERY_TIMEOUT_MS", defaults.query_timeout),
        };

        Self {
            host: std::env::var("CARBON_HOST").unwrap_or_else(|_| Self::DEFAULT_HOST.to_string()),
            http: Protocol::Http(env_or("CARBON_HTTP_PORT", 8080)),
            tcp: Protocol::Tcp(env_or("CARBON_TCP_PORT", 5500)),
            address: std::env::var("CARBON_BUS_ADDRESS")
                .unwrap_or_else(|_| Self::DEFAULT_ADDRESS.to_string()),
            bridge_reply_timeout: env_millis(
                "CARBON_BRIDGE_REPLY_TIMEOUT_MS",
                Duration::from_millis(15_000),
            ),
            memcached,
        }
    }
}

impl Protocol {
    pub fn port(&self) -> u16 {
        match self {
            Protocol::Http(port) | Protocol::Tcp(port) => *port,
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Protocol::Http(..) => "http",
            Protocol::Tcp(..) => "tcp",
        }
    }
}

/// Splits a server list such as `"host1:11211 host2:11211"` or
/// `"host1:11211,host2:11211"`.
pub fn parse_servers(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(name, default.as_millis() as u64))
}

fn parse_or<T: FromStr>(name: &str, raw: &str, default: T) -> T {
    raw.trim().parse::<T>().unwrap_or_else(|_| {
        warn!("{} has unparseable value '{}', using default", name, raw);
        default
    })
}
