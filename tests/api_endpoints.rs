//! Integration tests for the ZakatChain API endpoints
//!
//! These tests drive the router end to end: registration and OTP login,
//! signed transfers, mining, the explorer and zakat runs.

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use zakatchain::api::build_api_router;
use zakatchain::config::Config;
use zakatchain::crypto::KeyPair;
use zakatchain::node::Node;
use zakatchain::persistence::InMemoryPersistence;

const ADMIN_EMAIL: &str = "admin@zakatchain.test";

fn setup() -> (Arc<Node>, TestServer) {
    let mut config = Config::default();
    config.mining.difficulty = 1;
    config.auth.admin_emails = vec![ADMIN_EMAIL.to_string()];

    let node = Arc::new(
        Node::with_persistence(config, Arc::new(InMemoryPersistence::new()))
            .expect("Failed to build node"),
    );
    let server = TestServer::new(build_api_router(node.clone())).expect("Failed to create test server");
    (node, server)
}

struct User {
    keypair: KeyPair,
    wallet_id: String,
    token: String,
}

async fn register(node: &Node, server: &TestServer, email: &str) -> User {
    let keypair = KeyPair::generate();
    let response = server
        .post("/api/auth/register")
        .json(&json!({
            "email": email,
            "fullName": "Test User",
            "cnic": "35202-1234567-1",
            "publicKey": keypair.public_key_hex(),
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let body: Value = response.json();
    let wallet_id = body["user"]["walletId"].as_str().unwrap().to_string();
    assert_eq!(wallet_id, keypair.wallet_id().to_string());
    assert_eq!(body["wallet"]["balance"].as_f64(), Some(100.0));

    // No mailer: read the fresh code straight from the store.
    let otp = node.accounts.login(email).unwrap();
    let response = server
        .post("/api/auth/verify-otp")
        .json(&json!({ "email": email, "otp": otp }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    let token = body["token"].as_str().unwrap().to_string();

    User {
        keypair,
        wallet_id,
        token,
    }
}

fn bearer(user: &User) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {}", user.token)).unwrap(),
    )
}

fn transfer_body(from: &User, to: &User, amount: &str) -> Value {
    let timestamp = Utc::now();
    let amount_value: zakatchain::amount::Amount = amount.parse().unwrap();
    let receiver = zakatchain::crypto::WalletId::new(to.wallet_id.clone());
    let signature = from
        .keypair
        .sign_transfer(&receiver, amount_value, &timestamp, "test")
        .unwrap();
    json!({
        "receiverWalletId": to.wallet_id,
        "amount": amount_value,
        "note": "test",
        "timestamp": timestamp.to_rfc3339(),
        "signature": signature,
    })
}

#[tokio::test]
async fn test_public_endpoints() {
    let (_node, server) = setup();

    let response = server.get("/api/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());

    let response = server.get("/api/mining/status").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["isMining"], false);
    assert_eq!(json["pendingTransactions"], 0);
    assert_eq!(json["currentDifficulty"], 1);
    assert_eq!(json["latestBlockIndex"], 0);
    assert!(json["latestBlockHash"].is_string());

    let response = server.get("/api/blocks").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["height"], 1);
    assert_eq!(json["blocks"].as_array().unwrap().len(), 1);

    let response = server.get("/api/blocks/validate").await;
    let json: Value = response.json();
    assert_eq!(json["valid"], true);

    let response = server.get(&format!("/api/blocks/{}", "ab".repeat(32))).await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_auth_required() {
    let (_node, server) = setup();

    let response = server.get("/api/auth/profile").await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .get("/api/wallet/balance")
        .add_header(
            HeaderName::from_static("authorization"),
            HeaderValue::from_static("Bearer not-a-token"),
        )
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn test_profile_and_beneficiaries() {
    let (node, server) = setup();
    let alice = register(&node, &server, "alice@zakatchain.test").await;
    let bob = register(&node, &server, "bob@zakatchain.test").await;

    let (name, value) = bearer(&alice);
    let response = server.get("/api/auth/profile").add_header(name.clone(), value.clone()).await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["email"], "alice@zakatchain.test");
    assert_eq!(json["isVerified"], true);
    assert_eq!(json["isAdmin"], false);

    let response = server
        .put("/api/auth/profile")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "fullName": "Alice Khan" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["fullName"], "Alice Khan");

    let response = server
        .post("/api/wallet/beneficiaries")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "name": "Bob", "walletId": bob.wallet_id }))
        .await;
    assert_eq!(response.status_code(), 201);
    let beneficiary: Value = response.json();
    let id = beneficiary["id"].as_str().unwrap().to_string();

    let response = server
        .post("/api/wallet/beneficiaries")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "name": "Nobody", "walletId": "f".repeat(40) }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get("/api/wallet/beneficiaries")
        .add_header(name.clone(), value.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["count"], 1);

    let response = server
        .delete(&format!("/api/wallet/beneficiaries/{}", id))
        .add_header(name.clone(), value.clone())
        .await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .delete(&format!("/api/wallet/beneficiaries/{}", id))
        .add_header(name, value)
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_transfer_mine_and_history() {
    let (node, server) = setup();
    let alice = register(&node, &server, "alice@zakatchain.test").await;
    let bob = register(&node, &server, "bob@zakatchain.test").await;
    let (alice_h, alice_v) = bearer(&alice);
    let (bob_h, bob_v) = bearer(&bob);

    let signed = transfer_body(&alice, &bob, "30");
    let response = server
        .post("/api/transactions/send")
        .add_header(alice_h.clone(), alice_v.clone())
        .json(&signed)
        .await;
    assert_eq!(response.status_code(), 201);
    let json: Value = response.json();
    assert_eq!(json["transaction"]["status"], "pending");

    let response = server
        .get("/api/transactions/pending")
        .add_header(alice_h.clone(), alice_v.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["count"], 1);

    // A body Alice signed does not verify for Bob's wallet.
    let response = server
        .post("/api/transactions/send")
        .add_header(bob_h.clone(), bob_v.clone())
        .json(&transfer_body(&alice, &bob, "1"))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/api/mining/mine")
        .add_header(bob_h.clone(), bob_v.clone())
        .await;
    assert_eq!(response.status_code(), 201);
    let json: Value = response.json();
    assert_eq!(json["status"], "mined");
    assert_eq!(json["block"]["index"], 1);
    let hash = json["block"]["hash"].as_str().unwrap().to_string();

    let response = server
        .post("/api/mining/mine")
        .add_header(bob_h.clone(), bob_v.clone())
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "noWorkAvailable");

    // Resending the confirmed request is refused.
    let response = server
        .post("/api/transactions/send")
        .add_header(alice_h.clone(), alice_v.clone())
        .json(&signed)
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get("/api/wallet/balance")
        .add_header(alice_h.clone(), alice_v.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["balance"].as_f64(), Some(70.0));

    let response = server
        .get("/api/wallet/balance")
        .add_header(bob_h.clone(), bob_v.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["balance"].as_f64(), Some(130.0));

    let response = server
        .get("/api/transactions/history")
        .add_header(alice_h.clone(), alice_v.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["count"], 1);
    assert_eq!(json["transactions"][0]["direction"], "sent");
    assert_eq!(json["transactions"][0]["status"], "confirmed");

    let response = server.get(&format!("/api/blocks/{}", hash)).await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .get("/api/logs/transactions")
        .add_header(bob_h, bob_v)
        .await;
    let json: Value = response.json();
    assert!(json["count"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_insufficient_funds_rejected() {
    let (node, server) = setup();
    let alice = register(&node, &server, "alice@zakatchain.test").await;
    let bob = register(&node, &server, "bob@zakatchain.test").await;
    let (name, value) = bearer(&alice);

    let response = server
        .post("/api/transactions/send")
        .add_header(name, value)
        .json(&transfer_body(&alice, &bob, "150"))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert!(json["error"].as_str().unwrap().contains("Insufficient funds"));
}

#[tokio::test]
async fn test_zakat_process_requires_admin_and_runs_once() {
    let (node, server) = setup();
    let admin = register(&node, &server, ADMIN_EMAIL).await;
    let alice = register(&node, &server, "alice@zakatchain.test").await;
    let (admin_h, admin_v) = bearer(&admin);
    let (alice_h, alice_v) = bearer(&alice);

    let response = server
        .post("/api/zakat/process")
        .add_header(alice_h.clone(), alice_v.clone())
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/api/zakat/process")
        .add_header(admin_h.clone(), admin_v.clone())
        .await;
    assert_eq!(response.status_code(), 200);
    let report: Value = response.json();
    assert_eq!(report["charged"].as_array().unwrap().len(), 2);

    let response = server
        .post("/api/mining/mine")
        .add_header(admin_h.clone(), admin_v.clone())
        .await;
    assert_eq!(response.status_code(), 201);

    let response = server
        .get("/api/zakat/history")
        .add_header(alice_h.clone(), alice_v.clone())
        .await;
    let json: Value = response.json();
    assert_eq!(json["count"], 1);
    assert_eq!(json["records"][0]["amount"].as_f64(), Some(2.5));

    let response = server
        .get("/api/wallet/balance")
        .add_header(alice_h, alice_v)
        .await;
    let json: Value = response.json();
    assert_eq!(json["balance"].as_f64(), Some(97.5));

    // Same month again: nobody is charged twice.
    let response = server
        .post("/api/zakat/process")
        .add_header(admin_h.clone(), admin_v.clone())
        .await;
    let report: Value = response.json();
    assert_eq!(report["charged"].as_array().unwrap().len(), 0);
    assert_eq!(report["alreadyProcessed"], 2);

    let response = server
        .get("/api/logs/system")
        .add_header(admin_h, admin_v)
        .await;
    assert_eq!(response.status_code(), 200);
}
