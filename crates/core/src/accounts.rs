//! Guide accounts and credential checks

use std::collections::HashMap;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;

use crate::config::{AccountConfig, ConfigError};
use crate::error::{Error, Result};

/// A guide login as configured for the event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    password_hash: String,
    /// Shared tour group name, if any
    pub group: Option<String>,
}

/// All accounts allowed to log in
#[derive(Debug, Clone, Default)]
pub struct Accounts {
    by_username: HashMap<String, Account>,
}

impl Accounts {
    /// Build the directory, rejecting unparsable password hashes
    pub fn from_config(accounts: &[AccountConfig]) -> std::result::Result<Self, ConfigError> {
        let mut by_username = HashMap::new();
        for account in accounts {
            PasswordHash::new(&account.password_hash).map_err(|e| {
                ConfigError::Invalid(format!(
                    "account '{}' has an invalid password hash: {}",
                    account.username, e
                ))
            })?;
            by_username.insert(
                account.username.clone(),
                Account {
                    username: account.username.clone(),
                    password_hash: account.password_hash.clone(),
                    group: account.group.clone(),
                },
            );
        }
        Ok(Self { by_username })
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }

    /// Check a username/password pair
    pub fn verify(&self, username: &str, password: &str) -> Result<&Account> {
        let account = self
            .by_username
            .get(username)
            .ok_or_else(|| Error::Authentication("unknown user".into()))?;

        let parsed_hash = PasswordHash::new(&account.password_hash)
            .map_err(|_| Error::Authentication("invalid stored password".into()))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| Error::Authentication("invalid password".into()))?;

        Ok(account)
    }
}

/// Hash a password into an Argon2 PHC string for the config file
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Authentication(format!("failed to hash password: {}", e)))
}
