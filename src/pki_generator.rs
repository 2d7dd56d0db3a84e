//! X.509v3 certificate assembly
//!
//! Shared by every issuance path of the [`CertificateAuthority`]. The kind of
//! certificate decides the extensions:
//!
//! ```text
//! Root CA        CA=true, pathlen=1   keyCertSign, cRLSign, digitalSignature
//! Subordinate CA CA=true, pathlen=0   keyCertSign, cRLSign, digitalSignature
//! Leaf           CA=false             digitalSignature, nonRepudiation,
//!                                     keyEncipherment, dataEncipherment
//! ```
//!
//! [`CertificateAuthority`]: crate::certificate_authority::CertificateAuthority

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private, Public};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509NameRef, X509};

use crate::error::Result;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ROOT_CA_PATH_LENGTH: u32 = 1;
const SUBORDINATE_CA_PATH_LENGTH: u32 = 0; // Can only sign end-entity certs
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Root,
    Subordinate,
    Leaf,
}

/// Validity window `[not_before, not_after)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    /// Window starting at `now` and lasting `days`.
    pub fn days_from(now: i64, days: u32) -> Self {
        Self {
            not_before: now,
            not_after: now + i64::from(days) * SECONDS_PER_DAY,
        }
    }

    pub fn days_from_now(days: u32) -> Self {
        Self::days_from(unix_now(), days)
    }
}

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Everything needed to produce one signed certificate.
pub struct CertificateTemplate<'a> {
    pub kind: CertificateKind,
    pub serial: &'a Asn1Integer,
    pub subject_name: &'a X509NameRef,
    pub issuer_name: &'a X509NameRef,
    pub subject_public_key: &'a PKeyRef<Public>,
    pub validity: Validity,
    pub signing_key: &'a PKeyRef<Private>,
}

/// Assemble and sign the certificate described by `template`.
pub fn build_certificate(template: CertificateTemplate<'_>) -> Result<X509> {
    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    builder.set_serial_number(template.serial)?;
    builder.set_subject_name(template.subject_name)?;
    builder.set_issuer_name(template.issuer_name)?;

    let not_before = Asn1Time::from_unix(template.validity.not_before)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix(template.validity.not_after)?;
    builder.set_not_after(&not_after)?;

    builder.set_pubkey(template.subject_public_key)?;

    match template.kind {
        CertificateKind::Root | CertificateKind::Subordinate => {
            let mut bc = BasicConstraints::new();
            bc.critical().ca();
            bc.pathlen(match template.kind {
                CertificateKind::Root => ROOT_CA_PATH_LENGTH,
                _ => SUBORDINATE_CA_PATH_LENGTH,
            });
            builder.append_extension(bc.build()?)?;

            let mut ku = KeyUsage::new();
            ku.critical();
            ku.key_cert_sign();
            ku.crl_sign();
            ku.digital_signature();
            builder.append_extension(ku.build()?)?;
        }
        CertificateKind::Leaf => {
            // No .ca() call - this is an end-entity certificate
            let mut bc = BasicConstraints::new();
            bc.critical();
            builder.append_extension(bc.build()?)?;

            let mut ku = KeyUsage::new();
            ku.critical();
            ku.digital_signature(); // appointment signatures
            ku.non_repudiation();
            ku.key_encipherment(); // session key wrapping
            ku.data_encipherment();
            builder.append_extension(ku.build()?)?;
        }
    }

    builder.sign(template.signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}
