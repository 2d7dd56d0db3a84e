//! Health Center PKI - Certificate hierarchy and secure appointment exchange
//!
//! Models a small health-center network with two trust problems:
//!
//! 1. a certificate hierarchy from one root authority down to individual
//!    patients and clinicians, and
//! 2. a signed and encrypted exchange of appointment requests and their
//!    confirmations between a patient and a clinician.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, pathlen=1)
//!   ├── Clinic CA (pathlen=0)          └── clinician certificates (CA=false)
//!   └── FNMT Patient CA (pathlen=0)    └── patient certificates (CA=false)
//! ```
//!
//! Booking an appointment:
//!
//! ```text
//! patient ── wrapped K, AES-GCM(request), sig_P, cert_P ──► clinician
//! patient ◄── AES-GCM(appointment id), sig_D ────────────── clinician
//! ```
//!
//! The appointment id is a SHA-256 fingerprint of the request's core fields.
//! Both parties compute it, and the exchange completes only if they agree.
//!
//! # Features
//!
//! - **Three-Tier PKI**: root, two scoped subordinates, leaf identities
//! - **Proof of Possession**: every issuance starts from a self-signed CSR
//! - **Chain Verification**: signatures and validity windows, leaf to root
//! - **Authenticated Encryption**: AES-256-GCM with RSA-OAEP key wrapping
//! - **Non-repudiation**: both directions are signed with SHA-256/RSA
//! - **Key Storage at Rest**: PEM files with optional PKCS#8 passphrase
//!
//! # Quick Start
//!
//! ```no_run
//! use health_center_pki::appointment::parse_date_time;
//! use health_center_pki::configs::AppConfig;
//! use health_center_pki::health_center::{HealthCenter, NewClinician, NewPatient};
//! use health_center_pki::key_store::MemoryKeyStore;
//! use health_center_pki::subject::Location;
//!
//! fn main() -> health_center_pki::error::Result<()> {
//!     let center = HealthCenter::open(AppConfig::default(), Box::new(MemoryKeyStore::new()))?;
//!
//!     center.register_patient(&NewPatient {
//!         id: "54026189V",
//!         full_name: "Lorenzo Largacha Sanz",
//!         phone: "+34666888166",
//!         age: 22,
//!         password: "12345ABC",
//!         location: Location::default(),
//!     })?;
//!     center.register_clinician(&NewClinician {
//!         id: "76281872A",
//!         full_name: "Manuel Fernandez Gil",
//!         phone: "+34222444777",
//!         age: 51,
//!         specialty: "Atencion Primaria",
//!         password: "1234asdf",
//!         clinic: None,
//!         location: Location::default(),
//!     })?;
//!
//!     let appointment = center.request_appointment(
//!         "54026189V",
//!         "76281872A",
//!         parse_date_time("2023-10-31 14:30:00")?,
//!         "Dolor de cabeza",
//!     )?;
//!     println!("Booked {}", appointment.id);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! ## [`certificate_authority`]
//!
//! Issues root, subordinate and leaf certificates and verifies
//! [leaf, subordinate, root] chains. Serial numbers are 128-bit random values.
//!
//! ## [`registrar`]
//!
//! Builds CSRs from [`subject::RoleAttributes`] and enrolls identities with the
//! subordinate authority for their role.
//!
//! ## [`hierarchy`]
//!
//! Bootstraps or reloads the root and the two subordinates and exposes a
//! [`hierarchy::TrustStore`] for verifiers.
//!
//! ## [`secure_channel`]
//!
//! The patient and clinician halves of the appointment exchange state machine.
//!
//! ## [`key_store`]
//!
//! Create-if-absent storage of keys and certificates under string handles.
//!
//! ## [`health_center`]
//!
//! Facade over registration, login, booking, cancellation and schedules.
//!
//! # Security Considerations
//!
//! - **Key Size**: RSA keys below 2048 bits are refused
//! - **Session Keys**: one per exchange, zeroized on drop, never logged
//! - **Private Keys**: files are created with 0600 permissions on Unix
//! - **Passwords**: PBKDF2-HMAC-SHA256, compared in constant time
//!
//! # Error Handling
//!
//! Library functions return [`error::Result`]. Trust failures
//! (`InvalidSignature`, `Expired`, `SignatureMismatch`, `IdentifierMismatch`)
//! are final: nothing in this crate retries them.

pub mod appointment;
pub mod certificate_authority;
pub mod configs;
pub mod credentials;
pub mod encryption;
pub mod error;
pub mod health_center;
pub mod hierarchy;
pub mod key_store;
pub mod keys;
pub mod pki_generator;
pub mod protocol;
pub mod record_store;
pub mod records;
pub mod registrar;
pub mod secure_channel;
pub mod subject;
