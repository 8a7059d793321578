use std::env;
use std::time::Duration;

use riptide_core::memory::MonitorConfig;
use riptide_core::EngineConfig;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub port: u16,
    pub redis_url: Option<String>,
    /// TTL applied to persisted session records in Redis. Keep it above the
    /// engine's resume window or records vanish while still resumable.
    pub store_ttl_seconds: u64,
    /// How long a fresh socket may sit silent before its handshake is due.
    pub handshake_timeout: Duration,
    /// Frames buffered per direction between the socket pump and a session.
    pub transport_buffer: usize,
    pub csrf_secret: Option<String>,
    pub csrf_ttl: Duration,
    pub engine: EngineConfig,
    pub monitor: MonitorConfig,
}

impl GateConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("RIPTIDE_GATE_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL").ok(),
            store_ttl_seconds: env::var("RIPTIDE_STORE_TTL")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(3600),
            handshake_timeout: Duration::from_millis(
                env::var("RIPTIDE_HANDSHAKE_TIMEOUT_MS")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(10_000),
            ),
            transport_buffer: env::var("RIPTIDE_TRANSPORT_BUFFER")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(64),
            csrf_secret: env::var("RIPTIDE_CSRF_SECRET").ok(),
            csrf_ttl: Duration::from_secs(
                env::var("RIPTIDE_CSRF_TTL")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(86_400),
            ),
            engine: EngineConfig::from_env(),
            monitor: MonitorConfig::from_env(),
        }
    }

    /// Command-line flags win over the environment.
    pub fn apply(mut self, cli: &Cli) -> Self {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(url) = &cli.redis_url {
            self.redis_url = Some(url.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn cli_flags_override_config() {
        let config = GateConfig {
            port: 8080,
            redis_url: None,
            store_ttl_seconds: 3600,
            handshake_timeout: Duration::from_secs(10),
            transport_buffer: 64,
            csrf_secret: None,
            csrf_ttl: Duration::from_secs(86_400),
            engine: EngineConfig::default(),
            monitor: MonitorConfig::default(),
        };
        let cli = Cli {
            port: Some(9191),
            redis_url: Some("redis://cache:6379".into()),
        };
        let config = config.apply(&cli);
        assert_eq!(config.port, 9191);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }
}
