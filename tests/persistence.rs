//! SQLite round trips: a node reopened on the same file sees the same chain,
//! balances, accounts, audit entries and zakat records.

use chrono::Utc;
use std::sync::Arc;
use tempfile::TempDir;
use zakatchain::accounts::RegisterRequest;
use zakatchain::amount::Amount;
use zakatchain::config::Config;
use zakatchain::crypto::{KeyPair, WalletId};
use zakatchain::engine::{MineOutcome, TransferRequest};
use zakatchain::node::Node;
use zakatchain::persistence::{Database, Persistence};

fn config_at(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.mining.difficulty = 1;
    config.database.path = dir
        .path()
        .join("data")
        .join("zakatchain.db")
        .to_string_lossy()
        .into_owned();
    config
}

fn register(node: &Node, email: &str) -> (KeyPair, WalletId) {
    let keypair = KeyPair::generate();
    let engine = node.engine.clone();
    let (account, _) = node
        .accounts
        .register(
            RegisterRequest {
                email: email.to_string(),
                full_name: "Test User".to_string(),
                cnic: "35202-1234567-1".to_string(),
                public_key: keypair.public_key_hex(),
            },
            |pk| engine.open_wallet(pk),
        )
        .unwrap();
    (keypair, account.wallet_id)
}

fn transfer(from: &KeyPair, to: &WalletId, amount: Amount) -> TransferRequest {
    let timestamp = Utc::now();
    TransferRequest {
        receiver: to.clone(),
        amount,
        note: String::new(),
        timestamp,
        signature: from.sign_transfer(to, amount, &timestamp, "").unwrap(),
    }
}

#[test]
fn test_reopen_restores_ledger_and_accounts() {
    let dir = TempDir::new().unwrap();
    let config = config_at(&dir);

    let (a, b, tip) = {
        let node = Node::init(config.clone()).unwrap();
        let (alice, a) = register(&node, "alice@zakatchain.test");
        let (_, b) = register(&node, "bob@zakatchain.test");

        node.engine
            .submit_transfer(&alice.wallet_id(), transfer(&alice, &b, Amount::from_coins(25)))
            .unwrap();
        let block = match node.engine.mine(None).unwrap() {
            MineOutcome::Mined(block) => block,
            MineOutcome::NoWorkAvailable => panic!("expected a block"),
        };
        node.zakat.run_for_period("2024-08", "manual").unwrap();
        node.engine.mine(None).unwrap();
        assert_eq!(block.header.index, 1);
        (a, b, node.engine.latest_block().hash_hex())
    };

    let node = Node::init(config).unwrap();
    assert_eq!(node.engine.chain_height(), 3);
    assert_eq!(node.engine.latest_block().hash_hex(), tip);
    assert!(node.engine.validate_chain().is_ok());

    // 75 and 125 after the transfer, less 2.5% each.
    assert_eq!(node.engine.balance_of(&a).unwrap(), "73.125".parse().unwrap());
    assert_eq!(node.engine.balance_of(&b).unwrap(), "121.875".parse().unwrap());

    let records = node.engine.zakat_book().records(None);
    assert_eq!(records.len(), 2);
    assert!(node.engine.zakat_book().is_processed(&a, "2024-08"));

    assert!(node.accounts.login("alice@zakatchain.test").is_ok());
    assert!(!node.engine.audit().system_logs(100).is_empty());
    assert!(!node.engine.audit().transaction_logs(Some(&b), 100).is_empty());
}

#[test]
fn test_pending_deduction_marker_released_on_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_at(&dir);

    let a = {
        let node = Node::init(config.clone()).unwrap();
        let (_, a) = register(&node, "alice@zakatchain.test");
        let report = node.zakat.run_for_period("2024-09", "manual").unwrap();
        assert_eq!(report.charged.len(), 1);
        assert!(node.engine.zakat_book().is_processed(&a, "2024-09"));
        a
    };

    // The mempool is not stored, so the unmined charge is gone and the
    // wallet can be charged again.
    let node = Node::init(config).unwrap();
    assert!(node.engine.pending().is_empty());
    assert!(!node.engine.zakat_book().is_processed(&a, "2024-09"));
    assert_eq!(node.engine.balance_of(&a).unwrap(), Amount::from_coins(100));
    let report = node.zakat.run_for_period("2024-09", "manual").unwrap();
    assert_eq!(report.charged.len(), 1);
}

#[test]
fn test_database_reads_back_chain() {
    let dir = TempDir::new().unwrap();
    let config = config_at(&dir);
    {
        let node = Node::init(config.clone()).unwrap();
        register(&node, "alice@zakatchain.test");
    }

    let db = Database::open(&config.database.path).unwrap();
    let (blocks, ledger) = db.load_chain().unwrap().expect("chain stored");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].header.index, 0);
    assert!(ledger.verify_consistency().is_ok());
    assert_eq!(db.load_accounts().unwrap().len(), 1);
}
