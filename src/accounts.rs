//! User accounts: registration, OTP login, bearer tokens and beneficiaries
//!
//! Accounts are indexed by id and by lowercase email behind one lock. Every
//! change is written through to the persistence backend.

use crate::blockchain::Wallet;
use crate::config::AuthConfig;
use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::persistence::Persistence;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const MAX_NAME_LENGTH: usize = 64;
const MAX_BENEFICIARIES: usize = 256;
const CNIC_DIGITS: usize = 13;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beneficiary {
    pub id: String,
    pub name: String,
    pub wallet_id: WalletId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpChallenge {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub cnic: String,
    pub wallet_id: WalletId,
    pub public_key: String,
    pub is_verified: bool,
    pub otp: Option<OtpChallenge>,
    pub beneficiaries: Vec<Beneficiary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the API shows of an account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub cnic: String,
    pub wallet_id: WalletId,
    pub public_key: String,
    pub is_verified: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterRequest {
    pub email: String,
    pub full_name: String,
    pub cnic: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub wallet_id: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Default)]
struct AccountsInner {
    by_id: HashMap<String, Account>,
    id_by_email: HashMap<String, String>,
}

impl AccountsInner {
    fn account_mut(&mut self, user_id: &str) -> Result<&mut Account, ChainError> {
        self.by_id
            .get_mut(user_id)
            .ok_or_else(|| ChainError::NotFound(format!("User {} not found", user_id)))
    }
}

pub struct AccountStore {
    inner: RwLock<AccountsInner>,
    settings: AuthConfig,
    persistence: Arc<dyn Persistence>,
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<(), ChainError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if !valid {
        return Err(ChainError::InvalidTransaction(format!("'{}' is not a valid email", email)));
    }
    Ok(())
}

fn validate_name(name: &str, field: &str) -> Result<(), ChainError> {
    if name.trim().is_empty() {
        return Err(ChainError::InvalidTransaction(format!("{} cannot be empty", field)));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ChainError::InvalidTransaction(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

/// A CNIC is 13 digits, optionally written as `12345-1234567-1`.
fn validate_cnic(cnic: &str) -> Result<(), ChainError> {
    let digits: String = cnic.chars().filter(|c| *c != '-').collect();
    if digits.len() != CNIC_DIGITS || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ChainError::InvalidTransaction(format!(
            "CNIC must contain exactly {} digits",
            CNIC_DIGITS
        )));
    }
    Ok(())
}

impl AccountStore {
    pub fn open(settings: AuthConfig, persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let mut inner = AccountsInner::default();
        for account in persistence.load_accounts()? {
            inner.id_by_email.insert(normalize_email(&account.email), account.id.clone());
            inner.by_id.insert(account.id.clone(), account);
        }
        Ok(AccountStore {
            inner: RwLock::new(inner),
            settings,
            persistence,
        })
    }

    fn new_otp(&self) -> OtpChallenge {
        OtpChallenge {
            code: format!("{:06}", rand::thread_rng().gen_range(0..1_000_000)),
            expires_at: Utc::now() + Duration::minutes(self.settings.otp_ttl_minutes),
        }
    }

    pub fn is_admin(&self, email: &str) -> bool {
        let email = normalize_email(email);
        self.settings
            .admin_emails
            .iter()
            .any(|admin| normalize_email(admin) == email)
    }

    pub fn profile_of(&self, account: &Account) -> Profile {
        Profile {
            id: account.id.clone(),
            email: account.email.clone(),
            full_name: account.full_name.clone(),
            cnic: account.cnic.clone(),
            wallet_id: account.wallet_id.clone(),
            public_key: account.public_key.clone(),
            is_verified: account.is_verified,
            is_admin: self.is_admin(&account.email),
            created_at: account.created_at,
        }
    }

    /// Validates the request, obtains the wallet through `create_wallet` and
    /// stores the account with a fresh OTP. Returns the account and the code.
    ///
    /// `create_wallet` must hand back an already existing wallet for the key:
    /// when the account write fails the wallet stays behind unowned, and a
    /// retry attaches it.
    pub fn register<F>(&self, request: RegisterRequest, create_wallet: F) -> Result<(Account, String), ChainError>
    where
        F: FnOnce(&str) -> Result<Wallet, ChainError>,
    {
        let email = normalize_email(&request.email);
        validate_email(&email)?;
        validate_name(&request.full_name, "Full name")?;
        validate_cnic(&request.cnic)?;

        let mut inner = self.inner.write();
        if inner.id_by_email.contains_key(&email) {
            return Err(ChainError::InvalidTransaction(format!(
                "Email {} is already registered",
                email
            )));
        }

        let public_key = request.public_key.trim();
        let wallet_id = WalletId::from_public_key_hex(&public_key.to_lowercase());
        if inner.by_id.values().any(|a| a.wallet_id == wallet_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Wallet {} already belongs to an account",
                wallet_id
            )));
        }

        let wallet = create_wallet(public_key)?;
        let otp = self.new_otp();
        let code = otp.code.clone();
        let now = Utc::now();
        let account = Account {
            id: random_id(),
            email: email.clone(),
            full_name: request.full_name.trim().to_string(),
            cnic: request.cnic.trim().to_string(),
            wallet_id: wallet.wallet_id.clone(),
            public_key: wallet.public_key.clone().unwrap_or_default(),
            is_verified: false,
            otp: Some(otp),
            beneficiaries: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.persistence.save_account(&account)?;
        inner.id_by_email.insert(email.clone(), account.id.clone());
        inner.by_id.insert(account.id.clone(), account.clone());

        info!(email = %email, otp = %code, "registration OTP issued");
        Ok((account, code))
    }

    /// Issues a fresh OTP for an existing account.
    pub fn login(&self, email: &str) -> Result<String, ChainError> {
        let email = normalize_email(email);
        let otp = self.new_otp();
        let code = otp.code.clone();

        let mut inner = self.inner.write();
        let id = inner
            .id_by_email
            .get(&email)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("User {} not found", email)))?;
        let account = inner.account_mut(&id)?;
        account.otp = Some(otp);
        account.updated_at = Utc::now();
        self.persistence.save_account(account)?;

        info!(email = %email, otp = %code, "login OTP issued");
        Ok(code)
    }

    /// Checks the OTP and returns a bearer token with the account.
    pub fn verify_otp(&self, email: &str, code: &str) -> Result<(String, Account), ChainError> {
        let email = normalize_email(email);
        let mut inner = self.inner.write();
        let id = inner
            .id_by_email
            .get(&email)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("User {} not found", email)))?;
        let account = inner.account_mut(&id)?;

        let challenge = account
            .otp
            .as_ref()
            .ok_or_else(|| ChainError::AuthenticationError("No OTP requested".to_string()))?;
        if challenge.expires_at < Utc::now() {
            return Err(ChainError::AuthenticationError("OTP has expired".to_string()));
        }
        if challenge.code != code.trim() {
            return Err(ChainError::AuthenticationError("Invalid OTP".to_string()));
        }

        account.otp = None;
        account.is_verified = true;
        account.updated_at = Utc::now();
        self.persistence.save_account(account)?;
        let account = account.clone();
        drop(inner);

        let token = self.issue_token(&account)?;
        Ok((token, account))
    }

    pub fn issue_token(&self, account: &Account) -> Result<String, ChainError> {
        let now = Utc::now();
        let claims = Claims {
            sub: account.id.clone(),
            email: account.email.clone(),
            wallet_id: account.wallet_id.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(self.settings.token_ttl_hours)).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
        )
        .map_err(|e| ChainError::AuthenticationError(format!("Failed to issue token: {}", e)))
    }

    /// Verifies a bearer token and returns its claims.
    pub fn authenticate(&self, token: &str) -> Result<Claims, ChainError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| ChainError::AuthenticationError(format!("Invalid token: {}", e)))?;

        if !self.inner.read().by_id.contains_key(&data.claims.sub) {
            return Err(ChainError::AuthenticationError("Unknown user".to_string()));
        }
        Ok(data.claims)
    }

    pub fn get(&self, user_id: &str) -> Result<Account, ChainError> {
        self.inner
            .read()
            .by_id
            .get(user_id)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("User {} not found", user_id)))
    }

    pub fn update_profile(
        &self,
        user_id: &str,
        full_name: Option<String>,
        email: Option<String>,
    ) -> Result<Account, ChainError> {
        let mut inner = self.inner.write();

        let new_email = match email {
            Some(email) => {
                let email = normalize_email(&email);
                validate_email(&email)?;
                match inner.id_by_email.get(&email) {
                    Some(owner) if owner != user_id => {
                        return Err(ChainError::InvalidTransaction(format!(
                            "Email {} is already registered",
                            email
                        )))
                    }
                    _ => Some(email),
                }
            }
            None => None,
        };
        if let Some(name) = &full_name {
            validate_name(name, "Full name")?;
        }

        let account = inner.account_mut(user_id)?;
        let old_email = account.email.clone();
        if let Some(name) = full_name {
            account.full_name = name.trim().to_string();
        }
        if let Some(email) = &new_email {
            account.email = email.clone();
        }
        account.updated_at = Utc::now();
        self.persistence.save_account(account)?;
        let account = account.clone();

        if let Some(email) = new_email {
            inner.id_by_email.remove(&old_email);
            inner.id_by_email.insert(email, user_id.to_string());
        }
        Ok(account)
    }

    /// Adds a beneficiary; `wallet_exists` is the caller's ledger lookup.
    pub fn add_beneficiary(
        &self,
        user_id: &str,
        name: &str,
        wallet_id: WalletId,
        wallet_exists: bool,
    ) -> Result<Beneficiary, ChainError> {
        validate_name(name, "Beneficiary name")?;
        if !wallet_exists {
            return Err(ChainError::UnknownWallet(wallet_id.to_string()));
        }

        let mut inner = self.inner.write();
        let account = inner.account_mut(user_id)?;
        if account.wallet_id == wallet_id {
            return Err(ChainError::InvalidTransaction(
                "Cannot add your own wallet as a beneficiary".to_string(),
            ));
        }
        if account.beneficiaries.iter().any(|b| b.wallet_id == wallet_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Wallet {} is already a beneficiary",
                wallet_id
            )));
        }
        if account.beneficiaries.len() >= MAX_BENEFICIARIES {
            return Err(ChainError::InvalidTransaction(format!(
                "Beneficiary list is full (max {})",
                MAX_BENEFICIARIES
            )));
        }

        let beneficiary = Beneficiary {
            id: random_id(),
            name: name.trim().to_string(),
            wallet_id,
            created_at: Utc::now(),
        };
        account.beneficiaries.push(beneficiary.clone());
        account.updated_at = Utc::now();
        self.persistence.save_account(account)?;
        Ok(beneficiary)
    }

    pub fn beneficiaries(&self, user_id: &str) -> Result<Vec<Beneficiary>, ChainError> {
        Ok(self.get(user_id)?.beneficiaries)
    }

    pub fn remove_beneficiary(&self, user_id: &str, beneficiary_id: &str) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        let account = inner.account_mut(user_id)?;
        let before = account.beneficiaries.len();
        account.beneficiaries.retain(|b| b.id != beneficiary_id);
        if account.beneficiaries.len() == before {
            return Err(ChainError::NotFound(format!(
                "Beneficiary {} not found",
                beneficiary_id
            )));
        }
        account.updated_at = Utc::now();
        self.persistence.save_account(account)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryPersistence;

    fn store() -> AccountStore {
        let settings = AuthConfig {
            admin_emails: vec!["Admin@Example.com".to_string()],
            ..AuthConfig::default()
        };
        AccountStore::open(settings, Arc::new(InMemoryPersistence::new())).unwrap()
    }

    fn wallet_for(public_key: &str) -> Result<Wallet, ChainError> {
        let now = Utc::now();
        Ok(Wallet {
            wallet_id: WalletId::from_public_key_hex(public_key),
            public_key: Some(public_key.to_string()),
            cached_balance: Amount::ZERO,
            is_system: false,
            created_at: now,
            updated_at: now,
        })
    }

    fn request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            full_name: "Amina Khan".to_string(),
            cnic: "35202-1234567-1".to_string(),
            public_key: KeyPair::generate().public_key_hex(),
        }
    }

    #[test]
    fn test_register_login_and_token() {
        let store = store();
        let (account, otp) = store.register(request("amina@example.com"), wallet_for).unwrap();
        assert_eq!(otp.len(), 6);
        assert!(!account.is_verified);

        let (token, verified) = store.verify_otp("AMINA@example.com", &otp).unwrap();
        assert!(verified.is_verified);

        let claims = store.authenticate(&token).unwrap();
        assert_eq!(claims.sub, account.id);
        assert_eq!(claims.wallet_id, account.wallet_id.to_string());

        // OTP is single use
        assert!(store.verify_otp("amina@example.com", &otp).is_err());
        let fresh = store.login("amina@example.com").unwrap();
        assert!(store.verify_otp("amina@example.com", &fresh).is_ok());
    }

    #[test]
    fn test_registration_validation() {
        let store = store();
        let mut bad_cnic = request("a@example.com");
        bad_cnic.cnic = "123".to_string();
        assert!(store.register(bad_cnic, wallet_for).is_err());
        assert!(store.register(request("not-an-email"), wallet_for).is_err());

        store.register(request("dup@example.com"), wallet_for).unwrap();
        assert!(store.register(request("dup@example.com"), wallet_for).is_err());
    }

    #[test]
    fn test_registration_retried_after_failed_account_write() {
        use crate::engine::{EngineSettings, LedgerEngine};

        let engine = LedgerEngine::open(EngineSettings::default(), Arc::new(InMemoryPersistence::new())).unwrap();
        let accounts_store = InMemoryPersistence::new();
        let store = AccountStore::open(AuthConfig::default(), Arc::new(accounts_store.clone())).unwrap();
        let req = request("retry@example.com");

        accounts_store.set_fail_writes(true);
        let failed = store.register(req.clone(), |pk| engine.open_wallet(pk));
        assert!(matches!(failed, Err(ChainError::DatabaseError(_))));
        accounts_store.set_fail_writes(false);

        let (account, _) = store.register(req.clone(), |pk| engine.open_wallet(pk)).unwrap();
        assert_eq!(account.wallet_id, WalletId::from_public_key_hex(&req.public_key));
        assert_eq!(engine.balance_of(&account.wallet_id).unwrap(), Amount::from_coins(100));

        // The key's wallet now has an owner.
        let mut other = request("other@example.com");
        other.public_key = req.public_key.clone();
        assert!(store.register(other, |pk| engine.open_wallet(pk)).is_err());
    }

    #[test]
    fn test_wrong_otp_and_bad_token() {
        let store = store();
        let (_, otp) = store.register(request("b@example.com"), wallet_for).unwrap();
        let wrong = if otp == "000000" { "111111" } else { "000000" };
        assert!(matches!(
            store.verify_otp("b@example.com", wrong),
            Err(ChainError::AuthenticationError(_))
        ));
        assert!(store.authenticate("garbage").is_err());
    }

    #[test]
    fn test_admin_emails_case_insensitive() {
        let store = store();
        assert!(store.is_admin("admin@example.com"));
        assert!(!store.is_admin("user@example.com"));
    }

    #[test]
    fn test_beneficiaries() {
        let store = store();
        let (account, _) = store.register(request("c@example.com"), wallet_for).unwrap();
        let friend = WalletId::from("friend");

        assert!(store
            .add_beneficiary(&account.id, "Friend", friend.clone(), false)
            .is_err());
        let added = store
            .add_beneficiary(&account.id, "Friend", friend.clone(), true)
            .unwrap();
        assert!(store
            .add_beneficiary(&account.id, "Again", friend, true)
            .is_err());
        assert_eq!(store.beneficiaries(&account.id).unwrap().len(), 1);

        store.remove_beneficiary(&account.id, &added.id).unwrap();
        assert!(store.beneficiaries(&account.id).unwrap().is_empty());
        assert!(store.remove_beneficiary(&account.id, &added.id).is_err());
    }

    #[test]
    fn test_update_profile_email_uniqueness() {
        let store = store();
        let (first, _) = store.register(request("d@example.com"), wallet_for).unwrap();
        store.register(request("e@example.com"), wallet_for).unwrap();

        assert!(store
            .update_profile(&first.id, None, Some("e@example.com".to_string()))
            .is_err());
        let updated = store
            .update_profile(&first.id, Some("New Name".to_string()), Some("f@example.com".to_string()))
            .unwrap();
        assert_eq!(updated.full_name, "New Name");
        assert!(store.login("f@example.com").is_ok());
        assert!(store.login("d@example.com").is_err());
    }
}
