//! Password credentials
//!
//! Login is independent of the certificate hierarchy. Passwords are stretched
//! with PBKDF2-HMAC-SHA256 over a random 16-byte salt and only the derived
//! 32-byte key is stored, hex encoded.

use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkcs5::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HealthPkiError, Result};
use crate::record_store::{JsonFileStore, Record};

pub const SALT_SIZE: usize = 16;
pub const DERIVED_KEY_SIZE: usize = 32;

#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    #[serde(with = "hex")]
    pub derived_key: Vec<u8>,
}

impl Record for CredentialRecord {
    const KIND: &'static str = "credentials";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Derived password keys, one per user id.
pub struct CredentialVault {
    store: JsonFileStore<CredentialRecord>,
    iterations: usize,
}

impl CredentialVault {
    pub fn open(directory: &Path, iterations: usize) -> Result<Self> {
        Ok(Self {
            store: JsonFileStore::open(directory)?,
            iterations,
        })
    }

    fn derive(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
        let mut key = vec![0u8; DERIVED_KEY_SIZE];
        pbkdf2_hmac(
            password.as_bytes(),
            salt,
            self.iterations,
            MessageDigest::sha256(),
            &mut key,
        )?;
        Ok(key)
    }

    /// # Errors
    /// `AlreadyRegistered` if `id` already has a password.
    pub fn register(&self, id: &str, password: &str) -> Result<()> {
        let mut salt = vec![0u8; SALT_SIZE];
        openssl::rand::rand_bytes(&mut salt)?;
        let derived_key = self.derive(password, &salt)?;
        self.store.insert(CredentialRecord {
            id: id.to_string(),
            salt,
            derived_key,
        })?;
        debug!(id, "stored credentials");
        Ok(())
    }

    /// Forget the password of `id`, if any.
    pub fn remove(&self, id: &str) -> Result<()> {
        if self.store.remove(id)?.is_some() {
            debug!(id, "removed credentials");
        }
        Ok(())
    }

    /// Check `password` for `id` in constant time.
    ///
    /// # Errors
    /// `NotFound` for an unknown id.
    pub fn verify(&self, id: &str, password: &str) -> Result<bool> {
        let record = self
            .store
            .find_by_id(id)?
            .ok_or_else(|| HealthPkiError::NotFound(format!("credentials for {}", id)))?;
        let candidate = self.derive(password, &record.salt)?;
        // memcmp::eq panics on length mismatch
        let matches = candidate.len() == record.derived_key.len()
            && memcmp::eq(&candidate, &record.derived_key);
        if !matches {
            warn!(id, "password verification failed");
        }
        Ok(matches)
    }
}
