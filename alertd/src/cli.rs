//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "ALERTD_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/alertd/alertd.toml";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "alertd",
    version,
    about = "Deliver alerts to subscribed recipients over email and chat"
)]
pub struct CliArgs {
    /// Configuration file
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, env = "ALERTD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Listen address of the HTTP API (overrides the configuration file)
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = CliArgs::parse_from([
            "alertd",
            "--config",
            "/tmp/a.toml",
            "--listen",
            "0.0.0.0:9000",
            "-vv",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/a.toml"));
        assert_eq!(args.listen, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(args.verbose, 2);
        assert!(args.log_dir.is_none());
    }

    #[test]
    fn test_invalid_listen_is_rejected() {
        assert!(CliArgs::try_parse_from(["alertd", "--listen", "nowhere"]).is_err());
    }

    #[test]
    fn test_command_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
