use crate::accounts::AccountStore;
use crate::config::{Config, DatabaseConfig};
use crate::engine::{EngineSettings, LedgerEngine};
use crate::error::ChainError;
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use crate::zakat::ZakatScheduler;
use parking_lot::RwLock;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Booting,
    Ready,
    /// Mining halted after a consistency fault; queries still work.
    Degraded,
    ShuttingDown,
}

/// Installs the fmt subscriber once. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Opens SQLite at the configured path, or an in-memory store for `":memory:"`.
pub fn open_persistence(config: &DatabaseConfig) -> Result<Arc<dyn Persistence>, ChainError> {
    if config.is_in_memory() {
        warn!("using in-memory persistence; ledger state is lost on exit");
        return Ok(Arc::new(InMemoryPersistence::new()));
    }

    let db_path = Path::new(&config.path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ChainError::IoError(format!("Failed to create data dir {:?}: {}", parent, e))
            })?;
        }
    }
    Ok(Arc::new(Database::open(&config.path)?))
}

pub struct Node {
    pub config: Config,
    pub engine: Arc<LedgerEngine>,
    pub accounts: Arc<AccountStore>,
    pub zakat: Arc<ZakatScheduler>,
    state: RwLock<NodeState>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn init(config: Config) -> Result<Self, ChainError> {
        let persistence = open_persistence(&config.database)?;
        Self::with_persistence(config, persistence)
    }

    /// Builds the node on an existing backend. The restored chain is
    /// re-verified; a node never starts on a faulty ledger.
    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let settings = EngineSettings::from_config(&config)?;
        let engine = Arc::new(LedgerEngine::open(settings, persistence.clone())?);
        if let Err(e) = engine.validate_chain() {
            error!(error = %e, "stored chain failed validation, refusing to start");
            return Err(e);
        }

        let accounts = Arc::new(AccountStore::open(config.auth.clone(), persistence)?);
        let zakat = Arc::new(ZakatScheduler::new(engine.clone(), config.zakat.enabled));

        info!(
            height = engine.chain_height(),
            difficulty = config.mining.difficulty,
            pool_wallet = %config.zakat.pool_wallet_id,
            "node initialised"
        );

        Ok(Node {
            config,
            engine,
            accounts,
            zakat,
            state: RwLock::new(NodeState::Booting),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> NodeState {
        let state = *self.state.read();
        if state == NodeState::Ready && self.engine.halt_reason().is_some() {
            return NodeState::Degraded;
        }
        state
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the API, the zakat task and any in-flight mining run.
    pub fn shutdown(&self) {
        *self.state.write() = NodeState::ShuttingDown;
        self.shutdown.cancel();
        self.engine.cancel_mining();
    }

    /// Runs until Ctrl-C or [`Node::shutdown`].
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let zakat_task = tokio::spawn(self.zakat.clone().run_monthly(self.shutdown.clone()));

        let node = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    node.shutdown();
                }
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        });

        *self.state.write() = NodeState::Ready;
        let result = Node::start_api(self.clone()).await;

        self.shutdown();
        if let Err(e) = zakat_task.await {
            warn!(error = %e, "zakat task ended abnormally");
        }
        info!(height = self.engine.chain_height(), "node stopped");
        result
    }

    #[cfg(feature = "api")]
    async fn start_api(node: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let addr: std::net::SocketAddr =
            format!("{}:{}", node.config.server.bind_address, node.config.server.api_port).parse()?;
        let shutdown = node.shutdown_token();
        crate::api::run_api_server(node, addr, shutdown).await
    }

    #[cfg(not(feature = "api"))]
    async fn start_api(node: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        warn!("API feature not enabled in this build; running scheduler only");
        node.shutdown.cancelled().await;
        Ok(())
    }
}
