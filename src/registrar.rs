//! Identity Registration Module
//!
//! Turns a patient's or clinician's attributes into a certificate signing
//! request and drives issuance through the matching subordinate authority.
//!
//! # Enrollment
//! ```text
//! generate key pair ─► build CSR (self-signed) ─► subordinate issues leaf
//!                                                       │
//!            <id>_cert, <id>_private_key, <id>_public_key ◄┘  (create-if-absent)
//! ```
//!
//! # Example
//! ```rust,no_run
//! use health_center_pki::registrar::IdentityRegistrar;
//! use health_center_pki::subject::{Location, RoleAttributes};
//! # fn example(registrar: IdentityRegistrar<'_>) -> health_center_pki::error::Result<()> {
//!
//! let enrollment = registrar.enroll(&RoleAttributes::Patient {
//!     id: "54026189V".to_string(),
//!     full_name: "Lorenzo Largacha Sanz".to_string(),
//!     location: Location::default(),
//! })?;
//! # Ok(())
//! # }
//! ```

use openssl::hash::MessageDigest;
use openssl::x509::{X509Req, X509};
use tracing::{info, warn};

use crate::certificate_authority::{serial_hex, CertificateAuthority};
use crate::error::{HealthPkiError, Result};
use crate::hierarchy::{IssuingAuthority, TrustHierarchy};
use crate::key_store::{certificate_handle, private_key_handle, public_key_handle, KeyMaterialStore};
use crate::keys::KeyPair;
use crate::subject::RoleAttributes;

/// Key pair and certificate of a freshly enrolled identity.
#[derive(Debug)]
pub struct Enrollment {
    pub key_pair: KeyPair,
    pub certificate: X509,
}

/// Registers patients and clinicians with the subordinate authority that
/// certifies their role.
pub struct IdentityRegistrar<'a> {
    authority: &'a CertificateAuthority,
    hierarchy: &'a TrustHierarchy,
    key_store: &'a dyn KeyMaterialStore,
    key_bits: u32,
    leaf_validity_days: u32,
}

impl<'a> IdentityRegistrar<'a> {
    pub fn new(
        authority: &'a CertificateAuthority,
        hierarchy: &'a TrustHierarchy,
        key_store: &'a dyn KeyMaterialStore,
        key_bits: u32,
        leaf_validity_days: u32,
    ) -> Self {
        Self {
            authority,
            hierarchy,
            key_store,
            key_bits,
            leaf_validity_days,
        }
    }

    /// Build a CSR for `role`, self-signed with `key_pair`.
    ///
    /// Omitted role fields take the role defaults (see
    /// [`RoleAttributes::to_subject`]).
    ///
    /// # Errors
    /// `Signing` if `key_pair` cannot produce a SHA-256 signature.
    pub fn build_csr(role: &RoleAttributes, key_pair: &KeyPair) -> Result<X509Req> {
        let name = role.to_subject().to_x509_name()?;
        let public_key = key_pair.public_key()?;

        let mut builder = X509Req::builder()?;
        builder.set_version(0)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(&public_key)?;
        builder
            .sign(key_pair.private_key(), MessageDigest::sha256())
            .map_err(|e| HealthPkiError::Signing(format!("Failed to sign CSR: {}", e)))?;
        Ok(builder.build())
    }

    /// Have `issuing_authority` certify `csr`.
    pub fn request_certificate(
        &self,
        csr: &X509Req,
        issuing_authority: &IssuingAuthority,
    ) -> Result<X509> {
        self.authority.issue_leaf_certificate(
            csr,
            issuing_authority.certificate(),
            issuing_authority.private_key(),
            self.leaf_validity_days,
        )
    }

    /// Generate keys for `role`, obtain its certificate and persist both.
    ///
    /// If the keys cannot be stored after the certificate, every handle of the
    /// id is removed again so a later enrollment can succeed.
    ///
    /// # Errors
    /// `AlreadyRegistered` if the id already holds a certificate.
    pub fn enroll(&self, role: &RoleAttributes) -> Result<Enrollment> {
        let id = role
            .id()
            .ok_or_else(|| HealthPkiError::InvalidRequest("identity has no id".to_string()))?;
        let issuer = self.hierarchy.issuer_for(role)?;

        let cert_handle = certificate_handle(id);
        if self.key_store.contains(&cert_handle)? {
            return Err(HealthPkiError::AlreadyRegistered(id.to_string()));
        }

        let key_pair = self.key_store.generate_keypair(self.key_bits)?;
        let csr = Self::build_csr(role, &key_pair)?;
        let certificate = self.request_certificate(&csr, issuer)?;

        // The certificate handle decides concurrent enrollments of one id.
        self.key_store
            .save_certificate(&cert_handle, &certificate)
            .map_err(|e| match e {
                HealthPkiError::AlreadyRegistered(_) => {
                    HealthPkiError::AlreadyRegistered(id.to_string())
                }
                other => other,
            })?;
        if let Err(e) = self.save_keys(id, &key_pair) {
            warn!(id, error = %e, "enrollment incomplete, releasing identity");
            self.key_store.remove_identity(id)?;
            return Err(e);
        }

        info!(id, serial = %serial_hex(&certificate), "enrolled identity");
        Ok(Enrollment {
            key_pair,
            certificate,
        })
    }

    fn save_keys(&self, id: &str, key_pair: &KeyPair) -> Result<()> {
        self.key_store
            .save_private_key(&private_key_handle(id), key_pair)?;
        let public_key = key_pair.public_key()?;
        self.key_store
            .save_public_key(&public_key_handle(id), &public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AppConfig;
    use crate::hierarchy::{AuthorityScope, TrustStore};
    use crate::key_store::{FlakyKeyStore, MemoryKeyStore};
    use crate::subject::{Location, SubjectAttributes};

    fn patient_role() -> RoleAttributes {
        RoleAttributes::Patient {
            id: "54026189V".to_string(),
            full_name: "Lorenzo Largacha Sanz".to_string(),
            location: Location::default(),
        }
    }

    fn setup() -> (CertificateAuthority, TrustHierarchy, MemoryKeyStore) {
        let store = MemoryKeyStore::new();
        let authority = CertificateAuthority::new(2048);
        let hierarchy = TrustHierarchy::generate(&authority, &store, &AppConfig::default()).unwrap();
        (authority, hierarchy, store)
    }

    #[test]
    fn test_csr_is_self_signed() {
        let key_pair = KeyPair::generate(2048).unwrap();
        let csr = IdentityRegistrar::build_csr(&patient_role(), &key_pair).unwrap();
        assert!(csr.verify(&key_pair.public_key().unwrap()).unwrap());

        let subject = SubjectAttributes::from_x509_name(csr.subject_name());
        assert_eq!(subject.id.as_deref(), Some("54026189V"));
        assert_eq!(subject.common_name, "Lorenzo Largacha Sanz");
    }

    #[test]
    fn test_enroll_persists_material() {
        let (authority, hierarchy, store) = setup();
        let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);
        let enrollment = registrar.enroll(&patient_role()).unwrap();

        let stored = store.load_certificate("54026189V_cert").unwrap();
        assert_eq!(stored.to_der().unwrap(), enrollment.certificate.to_der().unwrap());
        let private = store.load_private_key("54026189V_private_key").unwrap();
        let public = store.load_public_key("54026189V_public_key").unwrap();
        assert!(private.private_key().public_eq(&public));

        let trust: TrustStore = hierarchy.trust_store();
        trust
            .verify_leaf(&stored, AuthorityScope::NationalRegistrar)
            .unwrap();
    }

    #[test]
    fn test_second_enrollment_rejected() {
        let (authority, hierarchy, store) = setup();
        let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);
        registrar.enroll(&patient_role()).unwrap();
        assert!(matches!(
            registrar.enroll(&patient_role()),
            Err(HealthPkiError::AlreadyRegistered(id)) if id == "54026189V"
        ));
    }

    #[test]
    fn test_failed_key_write_releases_id() {
        let store = FlakyKeyStore::failing_on("_public_key");
        let authority = CertificateAuthority::new(2048);
        let hierarchy = TrustHierarchy::generate(&authority, &store, &AppConfig::default()).unwrap();
        let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);

        assert!(matches!(
            registrar.enroll(&patient_role()),
            Err(HealthPkiError::Io(_))
        ));
        assert!(!store.contains("54026189V_cert").unwrap());
        assert!(!store.contains("54026189V_private_key").unwrap());

        store.heal();
        registrar.enroll(&patient_role()).unwrap();
        assert!(store.contains("54026189V_public_key").unwrap());
    }

    #[test]
    fn test_request_certificate_surfaces_invalid_signature() {
        let (authority, hierarchy, store) = setup();
        let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);

        let claimed = KeyPair::generate(2048).unwrap();
        let other = KeyPair::generate(2048).unwrap();
        let mut builder = X509Req::builder().unwrap();
        builder
            .set_subject_name(&patient_role().to_subject().to_x509_name().unwrap())
            .unwrap();
        builder.set_pubkey(&claimed.public_key().unwrap()).unwrap();
        builder
            .sign(other.private_key(), MessageDigest::sha256())
            .unwrap();

        let issuer = hierarchy.subordinate(AuthorityScope::NationalRegistrar);
        assert!(matches!(
            registrar.request_certificate(&builder.build(), issuer),
            Err(HealthPkiError::InvalidSignature(_))
        ));
    }
}
