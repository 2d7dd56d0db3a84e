//! Key Material Storage Module
//!
//! Persists key pairs and certificates under opaque string handles. By
//! convention an identity `<id>` owns three handles:
//!
//! - `<id>_private_key`: PKCS#8 PEM, wrapped with AES-256-CBC when the store
//!   has a passphrase
//! - `<id>_public_key`: SubjectPublicKeyInfo PEM
//! - `<id>_cert`: X.509 PEM
//!
//! Every handle is written once. Saving to an existing handle fails with
//! `AlreadyRegistered`, which is what stops two certificates being issued for
//! the same subject id.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use openssl::pkey::{PKey, PKeyRef, Public};
use openssl::symm::Cipher;
use openssl::x509::{X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::error::{HealthPkiError, Result};
use crate::keys::KeyPair;

pub fn private_key_handle(id: &str) -> String {
    format!("{}_private_key", id)
}

pub fn public_key_handle(id: &str) -> String {
    format!("{}_public_key", id)
}

pub fn certificate_handle(id: &str) -> String {
    format!("{}_cert", id)
}

/// Storage for keys and certificates.
///
/// Implementors provide raw create-if-absent byte storage; encoding is shared.
pub trait KeyMaterialStore: Send + Sync {
    /// Store `bytes` under `handle` unless the handle already exists.
    fn put_new(&self, handle: &str, bytes: &[u8]) -> Result<()>;

    /// Bytes stored under `handle`, or `NotFound`.
    fn get(&self, handle: &str) -> Result<Vec<u8>>;

    fn contains(&self, handle: &str) -> Result<bool>;

    /// Delete whatever is stored under `handle`; a missing handle is not an
    /// error.
    fn remove(&self, handle: &str) -> Result<()>;

    /// Passphrase wrapping private keys at rest, if any.
    fn passphrase(&self) -> Option<&SecretString> {
        None
    }

    /// Remove the certificate and both keys of identity `id`.
    fn remove_identity(&self, id: &str) -> Result<()> {
        self.remove(&certificate_handle(id))?;
        self.remove(&private_key_handle(id))?;
        self.remove(&public_key_handle(id))
    }

    fn generate_keypair(&self, bits: u32) -> Result<KeyPair> {
        KeyPair::generate(bits)
    }

    fn save_private_key(&self, handle: &str, key: &KeyPair) -> Result<()> {
        let pem = match self.passphrase() {
            Some(passphrase) => key.private_key().private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(),
                passphrase.expose_secret().as_bytes(),
            )?,
            None => key.private_key().private_key_to_pem_pkcs8()?,
        };
        self.put_new(handle, &pem)
    }

    fn load_private_key(&self, handle: &str) -> Result<KeyPair> {
        let pem = self.get(handle)?;
        let private_key = match self.passphrase() {
            Some(passphrase) => {
                PKey::private_key_from_pem_passphrase(&pem, passphrase.expose_secret().as_bytes())
            }
            None => PKey::private_key_from_pem(&pem),
        }
        .map_err(|e| {
            HealthPkiError::Decryption(format!("Failed to load private key {}: {}", handle, e))
        })?;
        Ok(KeyPair::from_private_key(private_key))
    }

    fn save_public_key(&self, handle: &str, key: &PKeyRef<Public>) -> Result<()> {
        self.put_new(handle, &key.public_key_to_pem()?)
    }

    fn load_public_key(&self, handle: &str) -> Result<PKey<Public>> {
        Ok(PKey::public_key_from_pem(&self.get(handle)?)?)
    }

    fn save_certificate(&self, handle: &str, certificate: &X509Ref) -> Result<()> {
        self.put_new(handle, &certificate.to_pem()?)
    }

    fn load_certificate(&self, handle: &str) -> Result<X509> {
        Ok(X509::from_pem(&self.get(handle)?)?)
    }
}

/// Key material kept as PEM files in one directory.
pub struct FileKeyStore {
    directory: PathBuf,
    passphrase: Option<SecretString>,
}

impl FileKeyStore {
    /// Open (creating if needed) the store at `directory`.
    pub fn new(directory: impl Into<PathBuf>, passphrase: Option<String>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            passphrase: passphrase.map(SecretString::from),
        })
    }

    fn path_for(&self, handle: &str) -> PathBuf {
        let filename = format!("{}.pem", handle.replace(['/', '\\', ' '], "_"));
        self.directory.join(filename)
    }
}

impl KeyMaterialStore for FileKeyStore {
    fn put_new(&self, handle: &str, bytes: &[u8]) -> Result<()> {
        create_exclusive(&self.path_for(handle), handle, |file| {
            file.write_all(bytes)?;
            file.sync_all()
        })?;
        debug!(handle, "stored key material");
        Ok(())
    }

    fn get(&self, handle: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for(handle)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => HealthPkiError::NotFound(handle.to_string()),
            _ => e.into(),
        })
    }

    fn contains(&self, handle: &str) -> Result<bool> {
        Ok(self.path_for(handle).try_exists()?)
    }

    fn remove(&self, handle: &str) -> Result<()> {
        match fs::remove_file(self.path_for(handle)) {
            Ok(()) => {
                debug!(handle, "removed key material");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn passphrase(&self) -> Option<&SecretString> {
        self.passphrase.as_ref()
    }
}

/// Create `path` if absent and fill it with `write`.
///
/// A file left half written would claim the handle for good, so it is removed
/// again when `write` fails.
fn create_exclusive(
    path: &Path,
    handle: &str,
    write: impl FnOnce(&mut fs::File) -> io::Result<()>,
) -> Result<()> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(HealthPkiError::AlreadyRegistered(handle.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = restrict_permissions(path).and_then(|_| write(&mut file)) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            warn!(handle, error = %cleanup, "failed to remove partial key file");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Set restrictive permissions (Unix only)
fn restrict_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Key material held in process memory; nothing survives a restart.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyMaterialStore for MemoryKeyStore {
    fn put_new(&self, handle: &str, bytes: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.contains_key(handle) {
            return Err(HealthPkiError::AlreadyRegistered(handle.to_string()));
        }
        entries.insert(handle.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, handle: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(handle)
            .cloned()
            .ok_or_else(|| HealthPkiError::NotFound(handle.to_string()))
    }

    fn contains(&self, handle: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(handle))
    }

    fn remove(&self, handle: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(handle);
        Ok(())
    }
}

/// Memory store that refuses writes to handles ending in a given suffix until
/// healed.
#[cfg(test)]
pub(crate) struct FlakyKeyStore {
    inner: MemoryKeyStore,
    failing_suffix: Mutex<Option<String>>,
}

#[cfg(test)]
impl FlakyKeyStore {
    pub(crate) fn failing_on(suffix: &str) -> Self {
        Self {
            inner: MemoryKeyStore::new(),
            failing_suffix: Mutex::new(Some(suffix.to_string())),
        }
    }

    pub(crate) fn heal(&self) {
        *self.failing_suffix.lock().unwrap() = None;
    }
}

#[cfg(test)]
impl KeyMaterialStore for FlakyKeyStore {
    fn put_new(&self, handle: &str, bytes: &[u8]) -> Result<()> {
        let failing = self.failing_suffix.lock().unwrap();
        if failing.as_deref().is_some_and(|suffix| handle.ends_with(suffix)) {
            return Err(io::Error::new(ErrorKind::Other, "write refused").into());
        }
        self.inner.put_new(handle, bytes)
    }

    fn get(&self, handle: &str) -> Result<Vec<u8>> {
        self.inner.get(handle)
    }

    fn contains(&self, handle: &str) -> Result<bool> {
        self.inner.contains(handle)
    }

    fn remove(&self, handle: &str) -> Result<()> {
        self.inner.remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_handles() {
        assert_eq!(private_key_handle("54026189V"), "54026189V_private_key");
        assert_eq!(public_key_handle("54026189V"), "54026189V_public_key");
        assert_eq!(certificate_handle("54026189V"), "54026189V_cert");
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        let pair = store.generate_keypair(2048).unwrap();

        store.save_private_key("p_private_key", &pair).unwrap();
        store
            .save_public_key("p_public_key", &pair.public_key().unwrap())
            .unwrap();

        let loaded = store.load_private_key("p_private_key").unwrap();
        let public = store.load_public_key("p_public_key").unwrap();
        assert!(loaded.private_key().public_eq(&public));
    }

    #[test]
    fn test_passphrase_wraps_private_key() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), Some("correct horse".to_string())).unwrap();
        let pair = KeyPair::generate(2048).unwrap();
        store.save_private_key("k", &pair).unwrap();

        let raw = fs::read(dir.path().join("k.pem")).unwrap();
        assert!(String::from_utf8_lossy(&raw).contains("ENCRYPTED PRIVATE KEY"));
        assert!(store.load_private_key("k").is_ok());

        let wrong = FileKeyStore::new(dir.path(), Some("wrong".to_string())).unwrap();
        assert!(matches!(
            wrong.load_private_key("k"),
            Err(HealthPkiError::Decryption(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        store.put_new("secret", b"bytes").unwrap();
        let mode = fs::metadata(dir.path().join("secret.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_handle() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        assert!(matches!(
            store.load_certificate("nobody_cert"),
            Err(HealthPkiError::NotFound(_))
        ));
        assert!(!store.contains("nobody_cert").unwrap());
        assert!(matches!(
            MemoryKeyStore::new().get("nobody_cert"),
            Err(HealthPkiError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_if_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        store.put_new("76281872A_cert", b"first").unwrap();
        assert!(matches!(
            store.put_new("76281872A_cert", b"second"),
            Err(HealthPkiError::AlreadyRegistered(_))
        ));
        assert_eq!(store.get("76281872A_cert").unwrap(), b"first");
    }

    #[test]
    fn test_failed_write_releases_handle() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        let path = dir.path().join("54026189V_cert.pem");

        let result = create_exclusive(&path, "54026189V_cert", |file| {
            file.write_all(b"-----BEGIN")?;
            Err(io::Error::new(ErrorKind::Other, "disk full"))
        });
        assert!(matches!(result, Err(HealthPkiError::Io(_))));
        assert!(!path.exists());

        store.put_new("54026189V_cert", b"complete").unwrap();
        assert_eq!(store.get("54026189V_cert").unwrap(), b"complete");
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path(), None).unwrap();
        store.put_new("76281872A_cert", b"first").unwrap();
        store.remove("76281872A_cert").unwrap();
        assert!(!store.contains("76281872A_cert").unwrap());
        store.remove("76281872A_cert").unwrap();
        store.put_new("76281872A_cert", b"second").unwrap();

        let memory = MemoryKeyStore::new();
        memory.put_new("k", b"v").unwrap();
        memory.remove("k").unwrap();
        assert!(!memory.contains("k").unwrap());
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let store = Arc::new(MemoryKeyStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.put_new("54026189V_cert", &[i as u8]).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
