//! RSA key pairs and SHA-256 signatures
//!
//! Every identity in the network (root, subordinate authorities, patients and
//! clinicians) owns one RSA key pair generated with a fixed public exponent.
//! Signatures are PKCS#1 v1.5 over SHA-256, the same digest used for
//! certificate signing.

use std::fmt;

use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};

use crate::error::{HealthPkiError, Result};

/// Smallest modulus accepted for any key pair.
pub const MIN_RSA_KEY_BITS: u32 = 2048;
/// Public exponent shared by all generated keys.
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// An RSA private/public key pair.
///
/// The public half is derived from the private key on demand.
pub struct KeyPair {
    private_key: PKey<Private>,
}

impl KeyPair {
    /// Generate a fresh key pair of `bits` modulus size.
    ///
    /// # Errors
    /// `KeyGeneration` if `bits` is below [`MIN_RSA_KEY_BITS`] or OpenSSL
    /// fails to draw the primes.
    pub fn generate(bits: u32) -> Result<Self> {
        if bits < MIN_RSA_KEY_BITS {
            return Err(HealthPkiError::KeyGeneration(format!(
                "RSA modulus of {} bits is below the {} bit minimum",
                bits, MIN_RSA_KEY_BITS
            )));
        }
        let exponent = BigNum::from_u32(RSA_PUBLIC_EXPONENT)?;
        let rsa = Rsa::generate_with_e(bits, &exponent).map_err(|e| {
            HealthPkiError::KeyGeneration(format!("Failed to generate RSA keypair: {}", e))
        })?;
        let private_key = PKey::from_rsa(rsa).map_err(|e| {
            HealthPkiError::KeyGeneration(format!("Failed to create private key: {}", e))
        })?;
        Ok(Self { private_key })
    }

    /// Wrap an already loaded private key.
    pub fn from_private_key(private_key: PKey<Private>) -> Self {
        Self { private_key }
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    /// Extract the public half as a standalone key.
    pub fn public_key(&self) -> Result<PKey<Public>> {
        let der = self.private_key.public_key_to_der()?;
        Ok(PKey::public_key_from_der(&der)?)
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u32 {
        self.private_key.bits()
    }

    /// Sign `message` with the private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        sign(&self.private_key, message)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.bits())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// SHA-256 signature of `message` under `key`.
pub fn sign(key: &PKeyRef<Private>, message: &[u8]) -> Result<Vec<u8>> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)
        .map_err(|e| HealthPkiError::Signing(format!("Failed to create signer: {}", e)))?;
    signer
        .sign_oneshot_to_vec(message)
        .map_err(|e| HealthPkiError::Signing(format!("Failed to sign message: {}", e)))
}

/// Check `signature` over `message` under `key`.
///
/// Returns `Ok(false)` for a signature that does not verify, including one
/// that is malformed; `Err` only if the verifier cannot be set up.
pub fn verify<T: HasPublic>(key: &PKeyRef<T>, message: &[u8], signature: &[u8]) -> Result<bool> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    // OpenSSL reports a garbled signature as an error rather than `false`.
    Ok(verifier.verify_oneshot(signature, message).unwrap_or(false))
}
