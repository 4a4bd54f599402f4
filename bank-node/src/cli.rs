use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

use crate::config::{ConfigError, NodeConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a bank node, accepting commands over TCP.
    Serve(ServeArgs),
    /// Connect to a bank node and send commands interactively.
    Client(ClientArgs),
}

/// Every flag overrides the matching field of the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// JSON config file. Missing files are treated as empty.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address this bank answers to in `BC` and account references.
    #[arg(long)]
    pub address: Option<String>,

    /// Interface to bind the listener to.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Port to listen on; peers are dialled on the same port. Use 0 for an
    /// ephemeral port.
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub command_timeout_ms: Option<u64>,

    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    #[arg(long)]
    pub forward_timeout_ms: Option<u64>,

    /// Where the account snapshot is kept.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Append every event to this file as JSON lines.
    #[arg(long)]
    pub event_log: Option<PathBuf>,
}

impl ServeArgs {
    /// Loads the config file (if any), applies the flags and validates the
    /// result.
    pub fn resolve(&self) -> Result<NodeConfig, ConfigError> {
        let base = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        let config = self.apply(base);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.command_timeout_ms {
            config.command_timeout_ms = ms;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if let Some(ms) = self.forward_timeout_ms {
            config.forward_timeout_ms = Some(ms);
        }
        if let Some(path) = &self.state_file {
            config.state_path = path.clone();
        }
        if let Some(path) = &self.event_log {
            config.event_log = Some(path.clone());
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the bank node to connect to.
    #[arg(long, default_value = "127.0.0.1:65530")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_values() {
        let cli = Cli::parse_from([
            "bank-node",
            "serve",
            "--address",
            "10.0.0.5",
            "--port",
            "0",
            "--command-timeout-ms",
            "250",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = args.resolve().expect("resolve");

        assert_eq!(config.address, "10.0.0.5");
        assert_eq!(config.port, 0);
        assert_eq!(config.command_timeout_ms, 250);
        assert_eq!(config.idle_timeout_ms, NodeConfig::default().idle_timeout_ms);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = ServeArgs {
            address: Some("a/b".into()),
            ..ServeArgs::default()
        };
        assert!(matches!(args.resolve(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn client_defaults_to_the_standard_port() {
        let cli = Cli::parse_from(["bank-node", "client"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client");
        };
        assert_eq!(args.server.port(), 65530);
    }
}
