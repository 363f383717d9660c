//! Configuration for swarmd

use clap::Parser;
use switchyard_core::Multiaddr;
use switchyard_net::{CircuitConfig, HopConfig, SwarmConfig};

/// swarmd - switchyard swarm daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "swarmd")]
#[command(about = "Connects to peers, negotiates crypto and muxing, serves /echo/1.0.0")]
pub struct Config {
    /// Listen multiaddrs (comma-separated)
    #[arg(short, long, value_delimiter = ',', default_value = "/ip4/0.0.0.0/tcp/9200")]
    pub listen: Vec<Multiaddr>,

    /// Bootstrap peers (comma-separated multiaddrs ending in /p2p/<id>)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<Multiaddr>,

    /// Use the authenticated secure channel instead of plaintext
    #[arg(long)]
    pub secure: bool,

    /// Do not register the mplex muxer
    #[arg(long)]
    pub no_mplex: bool,

    /// Run identify on inbound sessions
    #[arg(long)]
    pub identify: bool,

    /// Enable circuit relay dialing
    #[arg(long)]
    pub relay: bool,

    /// Relay for other peers
    #[arg(long)]
    pub relay_hop: bool,

    /// Dial relay destinations that are not connected yet
    #[arg(long)]
    pub relay_active: bool,

    /// Timeout of a single transport dial attempt
    #[arg(long, default_value = "10")]
    pub dial_timeout_secs: u64,

    /// Timeout of a whole connect, 0 to disable
    #[arg(long, default_value = "30")]
    pub connect_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("At least one listen address is required");
        }
        if let Some(addr) = self.bootstrap.iter().find(|a| a.peer_id().is_none()) {
            anyhow::bail!("Bootstrap address {} has no /p2p/<id>", addr);
        }
        if (self.relay_hop || self.relay_active) && !self.relay {
            anyhow::bail!("--relay-hop and --relay-active require --relay");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        self.swarm_config().validate()?;
        Ok(())
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            dial_timeout_secs: self.dial_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            ..Default::default()
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            enabled: self.relay,
            hop: HopConfig {
                enabled: self.relay_hop,
                active: self.relay_active,
            },
        }
    }
}
