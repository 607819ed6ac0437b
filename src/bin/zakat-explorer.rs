#![forbid(unsafe_code)]
//! Block explorer for a stored ZakatChain database

use clap::Parser;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use zakatchain::blockchain::{Block, ChainStore};
use zakatchain::config::load_config_from;
use zakatchain::persistence::{Database, Persistence};
use zakatchain::transaction::TxKind;

#[derive(Parser)]
#[command(author, version, about = "Prints the stored chain and validates it", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
    /// SQLite database; defaults to database.path from the config
    #[arg(long)]
    database: Option<String>,
    /// Number of most recent blocks to show
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Also list wallet balances
    #[arg(long)]
    wallets: bool,
}

fn short(hash: &str) -> String {
    if hash.len() > 16 {
        format!("{}...{}", &hash[..8], &hash[hash.len() - 6..])
    } else {
        hash.to_string()
    }
}

fn kinds(block: &Block) -> String {
    let mut transfers = 0;
    let mut zakat = 0;
    let mut rewards = 0;
    for tx in &block.transactions {
        match tx.kind {
            TxKind::Transfer => transfers += 1,
            TxKind::ZakatDeduction { .. } => zakat += 1,
            TxKind::MiningReward => rewards += 1,
        }
    }
    format!("{}T / {}Z / {}R", transfers, zakat, rewards)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let path = match cli.database {
        Some(path) => path,
        None => load_config_from(&cli.config)?.database.path,
    };

    let db = Database::open(&path)?;
    let Some((blocks, ledger)) = db.load_chain()? else {
        println!("{}", format!("No chain stored in {}", path).yellow());
        return Ok(());
    };

    let chain = ChainStore::from_blocks(blocks)?;
    println!("{}", "ZakatChain Explorer".bright_cyan().bold());
    println!("{} {}", "Database:".cyan(), path);
    println!("{} {}", "Height:  ".cyan(), chain.len());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Index").add_attribute(Attribute::Bold),
            Cell::new("Hash").add_attribute(Attribute::Bold),
            Cell::new("Previous").add_attribute(Attribute::Bold),
            Cell::new("Txs").add_attribute(Attribute::Bold),
            Cell::new("Nonce").add_attribute(Attribute::Bold),
            Cell::new("Diff").add_attribute(Attribute::Bold),
            Cell::new("Timestamp").add_attribute(Attribute::Bold),
        ]);

    for block in chain.get_all().iter().rev().take(cli.limit) {
        let color = if block.header.index == 0 {
            TableColor::Yellow
        } else {
            TableColor::Green
        };
        table.add_row(vec![
            Cell::new(block.header.index).fg(color),
            Cell::new(short(&block.hash_hex())),
            Cell::new(short(&hex::encode(block.header.previous_hash))),
            Cell::new(kinds(block)),
            Cell::new(block.header.nonce),
            Cell::new(block.header.difficulty),
            Cell::new(block.header.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");

    if cli.wallets {
        let mut wallets: Vec<_> = ledger.wallets().collect();
        wallets.sort_by(|a, b| b.cached_balance.cmp(&a.cached_balance));

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Wallet", "Balance", "UTXOs", "System"]);
        for wallet in wallets {
            table.add_row(vec![
                Cell::new(wallet.wallet_id.as_str()),
                Cell::new(wallet.cached_balance.to_string()),
                Cell::new(ledger.utxos_of(&wallet.wallet_id).len()),
                Cell::new(if wallet.is_system { "yes" } else { "" }),
            ]);
        }
        println!("{table}");
    }

    println!();
    let verdict = chain.validate().and_then(|_| ledger.verify_consistency());
    match verdict {
        Ok(()) => println!("{}", "Chain valid: hashes, proof-of-work, links, merkle roots and balances check out".bright_green()),
        Err(e) => {
            println!("{} {}", "Chain INVALID:".bright_red().bold(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
