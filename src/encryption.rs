//! Session keys and authenticated encryption
//!
//! Each appointment exchange uses one fresh AES-256 key. The patient wraps it
//! for the clinician with RSA-OAEP; both directions of the exchange are then
//! sealed with AES-256-GCM under that key. The additional authenticated data
//! names the message kind, so a sealed request cannot be replayed as a
//! confirmation.

use std::fmt;

use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::rsa::Padding;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};

use crate::error::{HealthPkiError, Result};

/// Size of AES-256 key (256 bits = 32 bytes)
pub const AES_GCM_256_KEY_SIZE: usize = 32;
/// Size of AES-GCM nonce (96 bits = 12 bytes)
pub const AES_GCM_NONCE_SIZE: usize = 12;
/// Size of AES-GCM authentication tag (128 bits = 16 bytes)
pub const AES_GCM_TAG_SIZE: usize = 16;

/// Single-use symmetric key of one exchange. Zeroized on drop.
pub struct SessionKey {
    key: SecretBox<[u8; AES_GCM_256_KEY_SIZE]>,
}

impl SessionKey {
    pub fn generate() -> Result<Self> {
        let mut key = Box::new([0u8; AES_GCM_256_KEY_SIZE]);
        openssl::rand::rand_bytes(&mut key[..]).map_err(|e| {
            HealthPkiError::KeyGeneration(format!("Failed to generate random AES key: {}", e))
        })?;
        Ok(Self {
            key: SecretBox::new(key),
        })
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut key = Box::new([0u8; AES_GCM_256_KEY_SIZE]);
        if bytes.len() != key.len() {
            return Err(HealthPkiError::Decryption(format!(
                "session key must be {} bytes, got {}",
                AES_GCM_256_KEY_SIZE,
                bytes.len()
            )));
        }
        key.copy_from_slice(bytes);
        Ok(Self {
            key: SecretBox::new(key),
        })
    }

    /// Encrypt the key to `recipient` with RSA-OAEP.
    pub fn wrap_for<T: HasPublic>(&self, recipient: &PKeyRef<T>) -> Result<Vec<u8>> {
        let rsa = recipient.rsa()?;
        let mut ciphertext = vec![0u8; rsa.size() as usize];
        let len = rsa.public_encrypt(
            self.key.expose_secret(),
            &mut ciphertext,
            Padding::PKCS1_OAEP,
        )?;
        ciphertext.truncate(len);
        Ok(ciphertext)
    }

    /// Recover a key wrapped by [`SessionKey::wrap_for`].
    pub fn unwrap_with(wrapped: &[u8], private_key: &PKeyRef<Private>) -> Result<Self> {
        let rsa = private_key.rsa()?;
        let mut decrypted = vec![0u8; rsa.size() as usize];
        let len = rsa
            .private_decrypt(wrapped, &mut decrypted, Padding::PKCS1_OAEP)
            .map_err(|e| HealthPkiError::Decryption(format!("RSA decryption failed: {}", e)))?;
        let key = Self::from_slice(&decrypted[..len]);
        decrypted.iter_mut().for_each(|b| *b = 0);
        key
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedPayload> {
        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        openssl::rand::rand_bytes(&mut nonce)?;

        let mut tag = [0u8; AES_GCM_TAG_SIZE];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            self.key.expose_secret(),
            Some(&nonce),
            aad,
            plaintext,
            &mut tag,
        )?;

        Ok(SealedPayload {
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt and authenticate `sealed`.
    ///
    /// # Errors
    /// `Decryption` if the key, the data or `aad` differ from sealing time.
    pub fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.nonce.len() != AES_GCM_NONCE_SIZE || sealed.tag.len() != AES_GCM_TAG_SIZE {
            return Err(HealthPkiError::Decryption(
                "malformed nonce or tag".to_string(),
            ));
        }
        decrypt_aead(
            Cipher::aes_256_gcm(),
            self.key.expose_secret(),
            Some(&sealed.nonce),
            aad,
            &sealed.ciphertext,
            &sealed.tag,
        )
        .map_err(|e| HealthPkiError::Decryption(format!("AES-GCM decryption failed: {}", e)))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// AES-256-GCM output. Byte fields are hex encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex")]
    pub tag: Vec<u8>,
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    const AAD: &[u8] = b"appointment-request";

    #[test]
    fn test_seal_open_round_trip() {
        let key = SessionKey::generate().unwrap();
        let plaintext = b"2023-10-31 14:30:00 Dolor de cabeza";
        let sealed = key.seal(plaintext, AAD).unwrap();
        assert_ne!(sealed.ciphertext, plaintext.to_vec());
        assert_eq!(key.open(&sealed, AAD).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SessionKey::generate().unwrap();
        let other = SessionKey::generate().unwrap();
        let sealed = key.seal(b"payload", AAD).unwrap();
        assert!(matches!(
            other.open(&sealed, AAD),
            Err(HealthPkiError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampering_detected() {
        let key = SessionKey::generate().unwrap();
        let mut sealed = key.seal(b"payload", AAD).unwrap();
        sealed.ciphertext[0] ^= 0x80;
        assert!(key.open(&sealed, AAD).is_err());

        let sealed = key.seal(b"payload", AAD).unwrap();
        assert!(key.open(&sealed, b"appointment-confirmation").is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = SessionKey::generate().unwrap();
        let a = key.seal(b"payload", AAD).unwrap();
        let b = key.seal(b"payload", AAD).unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_wrap_unwrap() {
        let recipient = KeyPair::generate(2048).unwrap();
        let key = SessionKey::generate().unwrap();
        let wrapped = key.wrap_for(&recipient.public_key().unwrap()).unwrap();
        assert_eq!(wrapped.len(), 256);

        let unwrapped = SessionKey::unwrap_with(&wrapped, recipient.private_key()).unwrap();
        let sealed = key.seal(b"payload", AAD).unwrap();
        assert_eq!(unwrapped.open(&sealed, AAD).unwrap(), b"payload".to_vec());

        let stranger = KeyPair::generate(2048).unwrap();
        assert!(matches!(
            SessionKey::unwrap_with(&wrapped, stranger.private_key()),
            Err(HealthPkiError::Decryption(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SessionKey::generate().unwrap();
        assert_eq!(format!("{:?}", key), "SessionKey(<redacted>)");
    }

    #[test]
    fn test_sealed_payload_hex_fields() {
        let sealed = SealedPayload {
            nonce: vec![0xab; AES_GCM_NONCE_SIZE],
            tag: vec![0x01; AES_GCM_TAG_SIZE],
            ciphertext: vec![0xff, 0x00],
        };
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["ciphertext"], "ff00");
        assert_eq!(json["nonce"], "abababababababababababab");
    }
}
