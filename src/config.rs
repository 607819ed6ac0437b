//! Configuration management for ZakatChain

use crate::amount::Amount;
use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Database path that selects the in-memory store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub zakat: ZakatConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_DATABASE
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MiningConfig {
    /// Required leading zero hex nibbles in a block hash.
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default)]
    pub block_reward: f64,
    #[serde(default)]
    pub allow_empty_blocks: bool,
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: u64,
    #[serde(default)]
    pub default_miner_wallet: Option<String>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            max_batch: default_max_batch(),
            block_reward: 0.0,
            allow_empty_blocks: false,
            cancel_check_interval: default_cancel_check_interval(),
            default_miner_wallet: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZakatConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_basis_points")]
    pub rate_basis_points: u32,
    #[serde(default)]
    pub minimum_balance: f64,
    #[serde(default = "default_pool_wallet_id")]
    pub pool_wallet_id: String,
}

impl Default for ZakatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_basis_points: default_rate_basis_points(),
            minimum_balance: 0.0,
            pool_wallet_id: default_pool_wallet_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalletConfig {
    #[serde(default = "default_initial_grant")]
    pub initial_grant: f64,
    #[serde(default = "default_minimum_transfer")]
    pub minimum_transfer: f64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_grant: default_initial_grant(),
            minimum_transfer: default_minimum_transfer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    #[serde(default = "default_otp_ttl_minutes")]
    pub otp_ttl_minutes: i64,
    #[serde(default)]
    pub admin_emails: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
            otp_ttl_minutes: default_otp_ttl_minutes(),
            admin_emails: Vec::new(),
        }
    }
}

impl Config {
    /// Checks the values the engine cannot run without.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError(
                "database.path must be set in config.toml".to_string(),
            ));
        }
        if self.mining.difficulty > 64 {
            return Err(ChainError::ConfigError(format!(
                "mining.difficulty {} exceeds the 64 nibbles of a SHA-256 hash",
                self.mining.difficulty
            )));
        }
        if self.mining.max_batch == 0 {
            return Err(ChainError::ConfigError(
                "mining.max_batch must be at least 1".to_string(),
            ));
        }
        if self.mining.cancel_check_interval == 0 {
            return Err(ChainError::ConfigError(
                "mining.cancel_check_interval must be at least 1".to_string(),
            ));
        }
        if self.zakat.rate_basis_points > 10_000 {
            return Err(ChainError::ConfigError(format!(
                "zakat.rate_basis_points {} exceeds 10000",
                self.zakat.rate_basis_points
            )));
        }
        if self.zakat.pool_wallet_id.is_empty() {
            return Err(ChainError::ConfigError(
                "zakat.pool_wallet_id must be set in config.toml".to_string(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(ChainError::ConfigError(
                "auth.jwt_secret must not be empty".to_string(),
            ));
        }
        // Monetary settings must parse as amounts.
        self.block_reward()?;
        self.minimum_balance()?;
        self.initial_grant()?;
        self.minimum_transfer()?;
        Ok(())
    }

    pub fn block_reward(&self) -> Result<Amount, ChainError> {
        Amount::from_f64(self.mining.block_reward)
            .map_err(|e| ChainError::ConfigError(format!("mining.block_reward: {}", e)))
    }

    pub fn minimum_balance(&self) -> Result<Amount, ChainError> {
        Amount::from_f64(self.zakat.minimum_balance)
            .map_err(|e| ChainError::ConfigError(format!("zakat.minimum_balance: {}", e)))
    }

    pub fn initial_grant(&self) -> Result<Amount, ChainError> {
        Amount::from_f64(self.wallet.initial_grant)
            .map_err(|e| ChainError::ConfigError(format!("wallet.initial_grant: {}", e)))
    }

    pub fn minimum_transfer(&self) -> Result<Amount, ChainError> {
        Amount::from_f64(self.wallet.minimum_transfer)
            .map_err(|e| ChainError::ConfigError(format!("wallet.minimum_transfer: {}", e)))
    }

    /// Applies `PORT` and `JWT_SECRET` from the environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ChainError> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.api_port = port
                .parse()
                .map_err(|_| ChainError::ConfigError(format!("PORT '{}' is not a valid port", port)))?;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
        Ok(())
    }
}

/// Reads a config file; a missing file yields the defaults.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let mut config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str).map_err(|e| ChainError::ConfigError(e.to_string()))?
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, ChainError> {
    load_config_from("config.toml")
}

fn default_api_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_database_path() -> String {
    "./data/zakatchain.db".to_string()
}

fn default_difficulty() -> u32 {
    5
}

fn default_max_batch() -> usize {
    100
}

fn default_cancel_check_interval() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

fn default_rate_basis_points() -> u32 {
    250
}

fn default_pool_wallet_id() -> String {
    "zakat_pool_wallet_00000000000000000000".to_string()
}

fn default_initial_grant() -> f64 {
    100.0
}

fn default_minimum_transfer() -> f64 {
    0.01
}

fn default_jwt_secret() -> String {
    "zakatchain-development-secret".to_string()
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_otp_ttl_minutes() -> i64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.zakat.rate_basis_points, 250);
        assert_eq!(config.mining.difficulty, 5);
        assert_eq!(config.initial_grant().unwrap(), Amount::from_coins(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mining]\ndifficulty = 2\n\n[database]\npath = \":memory:\"").unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.mining.difficulty, 2);
        assert_eq!(config.mining.max_batch, 100);
        assert!(config.database.is_in_memory());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("[mining]\ndificulty = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.mining.difficulty = 65;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.zakat.rate_basis_points = 10_001;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mining.max_batch = 0;
        assert!(config.validate().is_err());
    }
}
