use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::subject::SubjectAttributes;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default = "default_root_ca")]
    pub root_ca: AuthorityConfig,
    #[serde(default = "default_clinic_ca")]
    pub clinic_ca: AuthorityConfig,
    #[serde(default = "default_registrar_ca")]
    pub registrar_ca: AuthorityConfig,
    #[serde(default)]
    pub leaf: LeafConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            crypto: CryptoConfig::default(),
            root_ca: default_root_ca(),
            clinic_ca: default_clinic_ca(),
            registrar_ca: default_registrar_ca(),
            leaf: LeafConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_key_directory")]
    pub key_directory: PathBuf,
    #[serde(default = "default_record_directory")]
    pub record_directory: PathBuf,
    /// Wraps private keys at rest as encrypted PKCS#8 when set.
    #[serde(default)]
    pub key_passphrase: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_directory: default_key_directory(),
            record_directory: default_record_directory(),
            key_passphrase: None,
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("key_directory", &self.key_directory)
            .field("record_directory", &self.record_directory)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_key_directory() -> PathBuf {
    PathBuf::from("data/keys")
}

fn default_record_directory() -> PathBuf {
    PathBuf::from("data/records")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CryptoConfig {
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: u32,
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            rsa_key_bits: default_rsa_key_bits(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

fn default_rsa_key_bits() -> u32 {
    2048
}

fn default_pbkdf2_iterations() -> usize {
    480_000
}

/// Distinguished name and lifetime of one certificate authority.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub locality: String,
    pub state: String,
    pub country: String,
    pub validity_days: u32,
}

impl AuthorityConfig {
    pub fn subject(&self) -> SubjectAttributes {
        SubjectAttributes {
            id: None,
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
            locality: self.locality.clone(),
            state: self.state.clone(),
            country: self.country.clone(),
        }
    }
}

fn authority(cn: &str, org: &str, ou: &str, validity_days: u32) -> AuthorityConfig {
    AuthorityConfig {
        common_name: cn.to_string(),
        organization: org.to_string(),
        organizational_unit: ou.to_string(),
        locality: "Madrid".to_string(),
        state: "Madrid".to_string(),
        country: "ES".to_string(),
        validity_days,
    }
}

fn default_root_ca() -> AuthorityConfig {
    authority(
        "Health Network Root CA",
        "Health Network",
        "Trust Services",
        3650, // 10 years
    )
}

fn default_clinic_ca() -> AuthorityConfig {
    authority("Centro de Salud CA", "Centro de Salud", "Clinicians", 365)
}

fn default_registrar_ca() -> AuthorityConfig {
    authority("FNMT Patient CA", "FNMT", "Patients", 365)
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeafConfig {
    #[serde(default = "default_leaf_validity")]
    pub validity_days: u32,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            validity_days: default_leaf_validity(),
        }
    }
}

fn default_leaf_validity() -> u32 {
    365
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}
