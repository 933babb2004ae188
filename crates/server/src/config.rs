// Event server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// API token registry: comma-separated `token=username:player_name`
    /// entries. Empty means no client can authenticate.
    pub api_tokens: String,
    /// Log filter directive (e.g. `info`, `chronicle_server=debug`).
    pub log_filter: String,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CHRONICLE_HOST` | `0.0.0.0` |
    /// | `CHRONICLE_PORT` | `3003` |
    /// | `CHRONICLE_API_TOKENS` | *(empty)* |
    /// | `CHRONICLE_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CHRONICLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("CHRONICLE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(3003);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let api_tokens = env("CHRONICLE_API_TOKENS").unwrap_or_default();
        let log_filter = env("CHRONICLE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, api_tokens, log_filter }
    }
}
