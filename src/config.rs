use std::time::Duration;

use clap::Args;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::Network;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";

/// Connection settings. Every field can also be provided through its environment variable.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Socket kind to dial: `tcp` or `unix`
    #[arg(long, env = "RESPLEX_NETWORK", default_value_t = Network::Tcp)]
    pub network: Network,

    /// `host:port` for tcp, a socket path for unix
    #[arg(short, long, env = "RESPLEX_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Give up dialing after this many milliseconds
    #[arg(long, env = "RESPLEX_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Bound every command to this many milliseconds; expiry closes the connection
    #[arg(long, env = "RESPLEX_COMMAND_TIMEOUT_MS")]
    pub command_timeout_ms: Option<u64>,

    /// Largest reply, in bytes, the connection buffers before failing
    #[arg(long, env = "RESPLEX_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}

impl Config {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: Network::Tcp,
            address: DEFAULT_ADDRESS.to_string(),
            connect_timeout_ms: None,
            command_timeout_ms: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_flag_defaults() {
        let cli = Cli::try_parse_from(["resplex"]).unwrap();

        // Environment variables are not set in the test environment.
        assert_eq!(cli.config, Config::default());
        assert_eq!(cli.config.command_timeout(), None);
    }

    #[test]
    fn parse_flags() {
        let cli = Cli::try_parse_from([
            "resplex",
            "--network",
            "unix",
            "--address",
            "/tmp/redis.sock",
            "--connect-timeout-ms",
            "250",
            "--command-timeout-ms",
            "1000",
            "--max-frame-size",
            "1024",
        ])
        .unwrap();

        assert_eq!(cli.config.network, Network::Unix);
        assert_eq!(cli.config.address, "/tmp/redis.sock");
        assert_eq!(
            cli.config.connect_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(cli.config.command_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(cli.config.max_frame_size, 1024);
    }

    #[test]
    fn reject_unknown_network() {
        assert!(Cli::try_parse_from(["resplex", "--network", "udp"]).is_err());
    }
}
