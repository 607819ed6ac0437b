#![forbid(unsafe_code)]
//! Offline key tool: generates keys and signs transfers for the send endpoint

use chrono::{DateTime, SubsecRound, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::json;
use zakatchain::amount::Amount;
use zakatchain::crypto::{canonical_payload, verify_payload, KeyPair, WalletId};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generates a new secp256k1 key pair
    Keygen {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Signs a transfer and prints the request body for /api/transactions/send
    Sign {
        /// Hex-encoded private key
        #[arg(long)]
        key: String,
        /// Receiver wallet id
        #[arg(long)]
        receiver: String,
        /// Amount, up to 8 decimal places
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "")]
        note: String,
        /// RFC 3339 timestamp; defaults to now
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Checks a signature against a payload
    Verify {
        #[arg(long)]
        public_key: String,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        signature: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { json } => keygen(json),
        Commands::Sign {
            key,
            receiver,
            amount,
            note,
            timestamp,
        } => sign(&key, &receiver, &amount, &note, timestamp.as_deref())?,
        Commands::Verify {
            public_key,
            payload,
            signature,
        } => {
            if verify_payload(&public_key, &payload, &signature) {
                println!("{}", "Signature valid".bright_green());
            } else {
                println!("{}", "Signature INVALID".bright_red().bold());
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn keygen(as_json: bool) {
    let keypair = KeyPair::generate();
    if as_json {
        println!(
            "{}",
            json!({
                "privateKey": keypair.secret_key_hex(),
                "publicKey": keypair.public_key_hex(),
                "walletId": keypair.wallet_id(),
            })
        );
        return;
    }

    println!("{}", "New key pair".bright_cyan().bold());
    println!("{} {}", "Wallet ID:  ".cyan(), keypair.wallet_id().to_string().bright_green());
    println!("{} {}", "Public key: ".cyan(), keypair.public_key_hex());
    println!("{} {}", "Private key:".cyan(), keypair.secret_key_hex().bright_red());
    println!();
    println!("{}", "Keep the private key secret; the server never sees it.".yellow());
}

fn sign(
    key: &str,
    receiver: &str,
    amount: &str,
    note: &str,
    timestamp: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = KeyPair::from_secret_hex(key)?;
    let receiver = WalletId::new(receiver.trim().to_lowercase());
    let amount: Amount = amount.parse()?;
    let timestamp: DateTime<Utc> = match timestamp {
        Some(ts) => DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc),
        None => Utc::now(),
    }
    .trunc_subsecs(0);

    let payload = canonical_payload(&keypair.wallet_id(), &receiver, amount, &timestamp, note);
    let signature = keypair.sign_transfer(&receiver, amount, &timestamp, note)?;

    println!("{} {}", "Payload:  ".cyan(), payload);
    println!("{} {}", "Signature:".cyan(), signature.bright_green());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "receiverWalletId": receiver,
            "amount": amount,
            "note": note,
            "timestamp": timestamp,
            "signature": signature,
        }))?
    );
    Ok(())
}
