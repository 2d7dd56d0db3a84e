//! Certificate Authority Module
//!
//! Issues and validates the certificates of the three-tier hierarchy:
//!
//! ```text
//! Root CA (self-signed)
//!   ├── Clinic CA (signed by Root)        → clinician certificates
//!   └── FNMT Patient CA (signed by Root)  → patient certificates
//! ```
//!
//! Subordinate and leaf certificates are only issued from a CSR whose
//! self-signature proves possession of the embedded public key. Serial numbers
//! are 128-bit random values, tracked so the same authority never hands out
//! the same serial twice.
//!
//! # Example
//! ```rust,no_run
//! use health_center_pki::certificate_authority::{verify_chain, CertificateAuthority};
//! use health_center_pki::subject::SubjectAttributes;
//! # fn example(subject: SubjectAttributes) -> health_center_pki::error::Result<()> {
//!
//! let authority = CertificateAuthority::new(2048);
//! let (root_key, root_cert) = authority.issue_root_certificate(&subject, 3650)?;
//! verify_chain(&root_cert, &root_cert, &root_cert)?;
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::{X509Ref, X509Req, X509};
use tracing::{debug, info, warn};

use crate::error::{ChainError, ChainLink, HealthPkiError, Result};
use crate::keys::KeyPair;
use crate::pki_generator::{
    build_certificate, unix_now, CertificateKind, CertificateTemplate, Validity,
};
use crate::subject::{name_entry, SubjectAttributes};

const SERIAL_BITS: i32 = 128;

/// Issues root, subordinate and leaf certificates.
///
/// The authority itself holds no signing keys: the issuer key and certificate
/// are passed to each issuance, so the same instance serves the root and both
/// subordinates while keeping one serial registry.
///
/// The registry lives in memory and grows by one serial per issued
/// certificate for the lifetime of the instance. It is not persisted, so
/// uniqueness across restarts rests on the 128-bit random draw alone.
#[derive(Debug)]
pub struct CertificateAuthority {
    key_bits: u32,
    issued_serials: Mutex<HashSet<Vec<u8>>>,
}

impl CertificateAuthority {
    /// Create an authority generating `key_bits` RSA keys for new roots.
    pub fn new(key_bits: u32) -> Self {
        Self {
            key_bits,
            issued_serials: Mutex::new(HashSet::new()),
        }
    }

    /// Generate a key pair and a self-signed root certificate.
    ///
    /// # Errors
    /// `KeyGeneration` if the key pair cannot be drawn.
    pub fn issue_root_certificate(
        &self,
        subject: &SubjectAttributes,
        validity_days: u32,
    ) -> Result<(KeyPair, X509)> {
        let key_pair = KeyPair::generate(self.key_bits)?;
        let public_key = key_pair.public_key()?;
        let name = subject.to_x509_name()?;
        let serial = self.next_serial()?;

        let certificate = build_certificate(CertificateTemplate {
            kind: CertificateKind::Root,
            serial: &serial,
            subject_name: &name,
            issuer_name: &name,
            subject_public_key: &public_key,
            validity: Validity::days_from_now(validity_days),
            signing_key: key_pair.private_key(),
        })?;

        info!(
            subject = %subject.common_name,
            serial = %serial_hex(&certificate),
            "issued root certificate"
        );
        Ok((key_pair, certificate))
    }

    /// Issue a subordinate CA certificate from `csr`, signed by the root.
    ///
    /// # Errors
    /// `InvalidSignature` if the CSR self-signature does not verify.
    pub fn issue_subordinate_certificate(
        &self,
        csr: &X509Req,
        issuer_certificate: &X509Ref,
        issuer_private_key: &PKeyRef<Private>,
        validity_days: u32,
    ) -> Result<X509> {
        self.issue_from_csr(
            CertificateKind::Subordinate,
            csr,
            issuer_certificate,
            issuer_private_key,
            Validity::days_from_now(validity_days),
        )
    }

    /// Issue an end-identity certificate from `csr`, signed by a subordinate.
    ///
    /// # Errors
    /// `InvalidSignature` if the CSR self-signature does not verify.
    pub fn issue_leaf_certificate(
        &self,
        csr: &X509Req,
        issuer_certificate: &X509Ref,
        issuer_private_key: &PKeyRef<Private>,
        validity_days: u32,
    ) -> Result<X509> {
        self.issue_from_csr(
            CertificateKind::Leaf,
            csr,
            issuer_certificate,
            issuer_private_key,
            Validity::days_from_now(validity_days),
        )
    }

    /// Issue a certificate of `kind` with an explicit validity window.
    pub fn issue_from_csr(
        &self,
        kind: CertificateKind,
        csr: &X509Req,
        issuer_certificate: &X509Ref,
        issuer_private_key: &PKeyRef<Private>,
        validity: Validity,
    ) -> Result<X509> {
        let requested_key = csr.public_key()?;
        if !csr.verify(&requested_key).unwrap_or(false) {
            warn!(
                subject = %name_entry(csr.subject_name(), openssl::nid::Nid::COMMONNAME),
                "rejected CSR with invalid self-signature"
            );
            return Err(HealthPkiError::InvalidSignature(
                "CSR self-signature does not match its public key".to_string(),
            ));
        }

        if !issuer_certificate
            .public_key()?
            .public_eq(issuer_private_key)
        {
            return Err(HealthPkiError::InvalidRequest(
                "issuer private key does not match issuer certificate".to_string(),
            ));
        }

        let serial = self.next_serial()?;
        let certificate = build_certificate(CertificateTemplate {
            kind,
            serial: &serial,
            subject_name: csr.subject_name(),
            issuer_name: issuer_certificate.subject_name(),
            subject_public_key: &requested_key,
            validity,
            signing_key: issuer_private_key,
        })?;

        info!(
            kind = ?kind,
            subject = %name_entry(csr.subject_name(), openssl::nid::Nid::COMMONNAME),
            issuer = %name_entry(issuer_certificate.subject_name(), openssl::nid::Nid::COMMONNAME),
            serial = %serial_hex(&certificate),
            "issued certificate"
        );
        Ok(certificate)
    }

    /// Draw a 128-bit serial not yet used by this authority.
    fn next_serial(&self) -> Result<Asn1Integer> {
        let mut issued = self
            .issued_serials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            let mut serial = BigNum::new()?;
            serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
            if issued.insert(serial.to_vec()) {
                return Ok(serial.to_asn1_integer()?);
            }
            debug!("serial collision, drawing again");
        }
    }

    /// Number of serials handed out so far.
    pub fn issued_count(&self) -> usize {
        self.issued_serials
            .lock()
            .map(|issued| issued.len())
            .unwrap_or_default()
    }
}

/// Hex serial number of `certificate`, for logs.
pub fn serial_hex(certificate: &X509Ref) -> String {
    certificate
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .unwrap_or_else(|_| "<unreadable>".to_string())
}

/// Verify a [leaf, subordinate, root] chain against the current time.
pub fn verify_chain(
    leaf: &X509Ref,
    subordinate: &X509Ref,
    root: &X509Ref,
) -> std::result::Result<(), ChainError> {
    verify_chain_at(leaf, subordinate, root, unix_now())
}

/// Verify a [leaf, subordinate, root] chain at `now` (unix seconds).
///
/// Each certificate's signature is checked under its issuer's key before its
/// validity window, walking from the leaf up to the self-signed root. The
/// first failure is returned.
pub fn verify_chain_at(
    leaf: &X509Ref,
    subordinate: &X509Ref,
    root: &X509Ref,
    now: i64,
) -> std::result::Result<(), ChainError> {
    let now = Asn1Time::from_unix(now)?;

    check_signature(leaf, subordinate, ChainLink::Leaf)?;
    check_validity(leaf, &now, ChainLink::Leaf)?;
    check_signature(subordinate, root, ChainLink::Subordinate)?;
    check_validity(subordinate, &now, ChainLink::Subordinate)?;
    check_signature(root, root, ChainLink::Root)?;
    check_validity(root, &now, ChainLink::Root)?;
    Ok(())
}

fn check_signature(
    certificate: &X509Ref,
    issuer: &X509Ref,
    link: ChainLink,
) -> std::result::Result<(), ChainError> {
    if certificate.issuer_name().try_cmp(issuer.subject_name())? != Ordering::Equal {
        return Err(ChainError::InvalidSignature(link));
    }
    let issuer_key = issuer.public_key()?;
    // A corrupted signature can surface as an OpenSSL error instead of `false`.
    if !certificate.verify(&issuer_key).unwrap_or(false) {
        return Err(ChainError::InvalidSignature(link));
    }
    Ok(())
}

/// `not_before <= now < not_after`
fn check_validity(
    certificate: &X509Ref,
    now: &Asn1Time,
    link: ChainLink,
) -> std::result::Result<(), ChainError> {
    let started = certificate.not_before().compare(now)? != Ordering::Greater;
    let not_ended = certificate.not_after().compare(now)? == Ordering::Greater;
    if started && not_ended {
        Ok(())
    } else {
        Err(ChainError::Expired(link))
    }
}
