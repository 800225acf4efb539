//! Launch-time configuration for a node process.
use clap::Parser;
use std::path::PathBuf;

/// CLI flags for launching a `dynamo-lite` node.
#[derive(Parser, Debug, Clone)]
#[command(name = "dynamo-lite-node")]
#[command(version, about = "A replicated, horizontally-scalable key-value store node", long_about = None)]
pub struct NodeConfig {
    /// This node's unique identifier.
    #[arg(long)]
    pub node_id: String,

    /// Host to bind the cluster RPC listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Port to bind the cluster RPC listener to.
    #[arg(long, default_value_t = crate::network::DEFAULT_PORT)]
    pub bind_port: u16,

    /// Directory for the write-ahead log and content-addressed value store.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Address of an existing node to join on startup.
    #[arg(long)]
    pub seed: Option<String>,

    /// Disable the gossip/probe background loops (single-node mode).
    #[arg(long, default_value_t = false)]
    pub no_gossip: bool,
}

impl NodeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}
