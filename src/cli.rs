//! Command line arguments.

use clap::Parser;
use std::path::PathBuf;

/// btadapterd - Bluetooth adapter control daemon.
#[derive(Debug, Parser)]
#[command(
    name = "btadapterd",
    version,
    about = "Bluetooth adapter control daemon"
)]
pub struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Send one JSON call to the running daemon and print the result
    #[arg(long = "call", value_name = "JSON")]
    pub call: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_daemon_mode_takes_no_arguments() {
        let cli = Cli::try_parse_from(["btadapterd"]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.call.is_none());
    }

    #[test]
    fn test_config_and_call() {
        let cli = Cli::try_parse_from([
            "btadapterd",
            "--config",
            "/etc/bt.json",
            "--call",
            r#"{"method":"ListAdapters"}"#,
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bt.json")));
        assert_eq!(cli.call.as_deref(), Some(r#"{"method":"ListAdapters"}"#));

        let cli = Cli::try_parse_from(["btadapterd", "-c", "bt.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bt.json")));
    }

    #[test]
    fn test_missing_value_fails() {
        let err = Cli::try_parse_from(["btadapterd", "--config"]).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }

    #[test]
    fn test_unknown_flag_fails() {
        let err = Cli::try_parse_from(["btadapterd", "--verbose"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert!(err.to_string().contains("--verbose"));
    }
}
