//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tether", about = "Online content service")]
pub struct CliArgs {
    /// Service address clients connect to.
    #[arg(long)]
    pub address: Option<String>,

    /// Service port clients connect to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Port the server listens on.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Developer API key.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Project name.
    #[arg(long)]
    pub project: Option<String>,

    /// Local content directory.
    #[arg(long)]
    pub content_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.network.service_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.service_port = port;
        }
        if let Some(port) = args.listen_port {
            self.network.listen_port = port;
        }
        if let Some(ref key) = args.api_key {
            self.service.api_key = key.clone();
        }
        if let Some(ref project) = args.project {
            self.service.project_name = project.clone();
        }
        if let Some(ref dir) = args.content_dir {
            self.content.directory = dir.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            listen_port: Some(9000),
            api_key: Some("key".to_string()),
            address: Some("192.168.1.1".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.listen_port, 9000);
        assert_eq!(config.network.service_address, "192.168.1.1");
        assert_eq!(config.service.api_key, "key");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.service_port, 800);
        assert_eq!(config.content.directory, PathBuf::from("Content"));
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "tether",
            "--listen-port",
            "801",
            "--project",
            "Breakout",
            "--content-dir",
            "/tmp/content",
        ]);
        assert_eq!(args.listen_port, Some(801));
        assert_eq!(args.project.as_deref(), Some("Breakout"));
        assert_eq!(args.content_dir, Some(PathBuf::from("/tmp/content")));
        assert!(args.api_key.is_none());
    }
}
