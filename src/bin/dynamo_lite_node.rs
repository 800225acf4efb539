//! dynamo-lite-node — launch a single cluster node from the command line.
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use dynamo_lite::{Node, NodeConfig};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    dynamo_lite::init_logging();

    let config = NodeConfig::parse();
    let bind_addr = config.bind_addr();
    let seed = config.seed.clone();

    let node = Node::new(config)
        .await
        .context("failed to initialize node")?;

    println!("{}", "Starting dynamo-lite node...".bold().cyan());
    node.start().await.context("failed to start node")?;

    println!("  {} {}", "Node ID:".bright_white(), node.node_id());
    println!("  {} {}", "Address:".bright_white(), bind_addr);
    if let Some(seed) = &seed {
        println!("  {} {}", "Joined:".bright_white(), seed);
    }
    println!();
    println!("{}", "Node is running. Press Ctrl+C to stop.".green());

    signal::ctrl_c().await.ok();

    println!();
    println!("{}", "Shutting down...".yellow());
    node.stop().await.context("failed to shut down cleanly")?;
    println!("{}", "Stopped.".green());

    Ok(())
}
