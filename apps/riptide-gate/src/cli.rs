use clap::Parser;

/// WebSocket gateway for riptide sessions.
#[derive(Parser, Debug)]
#[command(name = "riptide-gate", version, about)]
pub struct Cli {
    /// Listen port; overrides RIPTIDE_GATE_PORT.
    #[arg(long)]
    pub port: Option<u16>,

    /// Redis connection URL; overrides REDIS_URL. Without one, session
    /// records are kept in process memory and do not survive a restart.
    #[arg(long)]
    pub redis_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_overrides() {
        let cli = Cli::try_parse_from(["riptide-gate", "--port", "9090", "--redis-url", "redis://cache:6379"])
            .unwrap();
        assert_eq!(cli.port, Some(9090));
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test_timeout::timeout]
    fn all_flags_are_optional() {
        let cli = Cli::try_parse_from(["riptide-gate"]).unwrap();
        assert!(cli.port.is_none());
        assert!(cli.redis_url.is_none());
    }
}
