#![forbid(unsafe_code)]
//! ZakatChain node: REST API plus the monthly zakat task

use clap::Parser;
use colored::*;
use std::sync::Arc;
use zakatchain::config::load_config_from;
use zakatchain::node::{init_tracing, Node};

#[derive(Parser)]
#[command(author, version, about = "Runs the ZakatChain ledger node", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
    /// Overrides server.api_port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config_from(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.api_port = port;
    }

    println!("{}", "╔══════════════════════════════════════════╗".bright_green());
    println!("{}", "║            ZakatChain Ledger Node         ║".bright_green().bold());
    println!("{}", "╚══════════════════════════════════════════╝".bright_green());
    println!(
        "{} {}:{}",
        "API:".cyan(),
        config.server.bind_address,
        config.server.api_port
    );
    println!("{} {}", "Database:".cyan(), config.database.path);
    println!("{} {}", "Difficulty:".cyan(), config.mining.difficulty);
    println!(
        "{} {}",
        "Zakat:".cyan(),
        if config.zakat.enabled {
            format!("{} bp monthly", config.zakat.rate_basis_points).green()
        } else {
            "disabled".yellow()
        }
    );
    println!();

    let node = Arc::new(Node::init(config)?);
    node.start().await
}
