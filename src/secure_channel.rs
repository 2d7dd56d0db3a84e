//! Signed and encrypted appointment exchange
//!
//! A patient books with a clinician over an untrusted channel. Each side runs
//! its half of one state machine:
//!
//! ```text
//! patient   Created → Signed → Encrypted → Sent ─────────────┐
//!                                                            │ AppointmentEnvelope
//! clinician Created → Received → Verified → Decrypted ◄──────┘
//!                                              │
//!                                              ▼ ConfirmationEnvelope
//! clinician                            ConfirmationSent
//! patient   ConfirmationReceived → ConfirmationVerified → Complete
//! ```
//!
//! Any step can end in `Failed(reason)`, which is terminal. Nothing is retried:
//! a request or confirmation that fails a check is discarded.
//!
//! The patient signs the canonical request bytes, seals them with a fresh
//! AES-256-GCM session key and wraps that key for the clinician's
//! chain-verified certificate. The clinician answers with the appointment
//! identifier, signed and sealed under the same key. The patient accepts only
//! if that identifier equals the fingerprint it computed itself.

use std::fmt;

use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::x509::{X509Ref, X509};
use tracing::{debug, info, warn};

use crate::appointment::{AppointmentId, AppointmentRequest};
use crate::encryption::SessionKey;
use crate::error::{HealthPkiError, Result};
use crate::hierarchy::{AuthorityScope, TrustStore};
use crate::keys::{self, KeyPair};
use crate::protocol::{AppointmentEnvelope, ConfirmationEnvelope};
use crate::subject::name_entry;

/// Additional authenticated data of a sealed request.
pub const REQUEST_AAD: &[u8] = b"health-center/appointment-request/v1";
/// Additional authenticated data of a sealed confirmation.
pub const CONFIRMATION_AAD: &[u8] = b"health-center/appointment-confirmation/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UntrustedCertificate,
    DecryptionFailed,
    SignatureMismatch,
    InvalidPayload,
    IdentifierMismatch,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::UntrustedCertificate => "untrusted-certificate",
            FailureReason::DecryptionFailed => "decryption-failed",
            FailureReason::SignatureMismatch => "signature-mismatch",
            FailureReason::InvalidPayload => "invalid-payload",
            FailureReason::IdentifierMismatch => "identifier-mismatch",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Created,
    Signed,
    Encrypted,
    Sent,
    Received,
    Verified,
    Decrypted,
    ConfirmationSent,
    ConfirmationReceived,
    ConfirmationVerified,
    Complete,
    Failed(FailureReason),
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// State bookkeeping shared by both halves.
struct Progress {
    party: &'static str,
    state: ExchangeState,
}

impl Progress {
    fn new(party: &'static str) -> Self {
        Self {
            party,
            state: ExchangeState::Created,
        }
    }

    fn require(&self, expected: ExchangeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HealthPkiError::InvalidRequest(format!(
                "{} exchange is {}, expected {}",
                self.party, self.state, expected
            )))
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        debug!(party = self.party, from = %self.state, to = %next, "exchange transition");
        self.state = next;
    }

    fn fail(&mut self, reason: FailureReason, error: HealthPkiError) -> HealthPkiError {
        warn!(party = self.party, from = %self.state, %reason, %error, "exchange failed");
        self.state = ExchangeState::Failed(reason);
        error
    }
}

/// Outcome of one exchange step; the error carries the reason it fails with.
type Step<T> = std::result::Result<T, (FailureReason, HealthPkiError)>;

trait Because<T> {
    fn because(self, reason: FailureReason) -> Step<T>;
}

impl<T, E: Into<HealthPkiError>> Because<T> for std::result::Result<T, E> {
    fn because(self, reason: FailureReason) -> Step<T> {
        self.map_err(|e| (reason, e.into()))
    }
}

fn subject_id(certificate: &X509Ref) -> String {
    name_entry(certificate.subject_name(), Nid::SERIALNUMBER)
}

/// Patient half of an exchange.
pub struct PatientExchange<'a> {
    request: AppointmentRequest,
    expected_id: AppointmentId,
    key_pair: &'a KeyPair,
    certificate: &'a X509Ref,
    trust: &'a TrustStore,
    session_key: Option<SessionKey>,
    clinician_key: Option<PKey<Public>>,
    progress: Progress,
}

impl<'a> PatientExchange<'a> {
    /// Start an exchange for `request`, signing as the holder of
    /// `certificate`.
    pub fn new(
        request: AppointmentRequest,
        key_pair: &'a KeyPair,
        certificate: &'a X509Ref,
        trust: &'a TrustStore,
    ) -> Self {
        Self {
            expected_id: request.fingerprint(),
            request,
            key_pair,
            certificate,
            trust,
            session_key: None,
            clinician_key: None,
            progress: Progress::new("patient"),
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.progress.state
    }

    pub fn request(&self) -> &AppointmentRequest {
        &self.request
    }

    /// Fingerprint the patient computed from its own request.
    pub fn appointment_id(&self) -> &AppointmentId {
        &self.expected_id
    }

    /// Sign, seal and address the request to `clinician_certificate`.
    ///
    /// # Errors
    /// `Chain` if the clinician certificate does not chain to the root
    /// through the clinic authority; `InvalidRequest` if it belongs to a
    /// different clinician than the one requested. Any error past the state
    /// check leaves the exchange `Failed`.
    pub fn send(&mut self, clinician_certificate: &X509Ref) -> Result<AppointmentEnvelope> {
        self.progress.require(ExchangeState::Created)?;
        self.try_send(clinician_certificate)
            .map_err(|(reason, e)| self.progress.fail(reason, e))
    }

    fn try_send(&mut self, clinician_certificate: &X509Ref) -> Step<AppointmentEnvelope> {
        self.trust
            .verify_leaf(clinician_certificate, AuthorityScope::Clinic)
            .because(FailureReason::UntrustedCertificate)?;
        let certified = subject_id(clinician_certificate);
        if certified != self.request.clinician_id {
            return Err((
                FailureReason::UntrustedCertificate,
                HealthPkiError::InvalidRequest(format!(
                    "certificate belongs to {}, not {}",
                    certified, self.request.clinician_id
                )),
            ));
        }
        let clinician_key = clinician_certificate
            .public_key()
            .because(FailureReason::UntrustedCertificate)?;

        let plaintext = self
            .request
            .to_canonical_bytes()
            .because(FailureReason::InvalidPayload)?;
        let signature = self
            .key_pair
            .sign(&plaintext)
            .because(FailureReason::InvalidPayload)?;
        self.progress.advance(ExchangeState::Signed);

        let session_key = SessionKey::generate().because(FailureReason::InvalidPayload)?;
        let sealed = session_key
            .seal(&plaintext, REQUEST_AAD)
            .because(FailureReason::InvalidPayload)?;
        self.progress.advance(ExchangeState::Encrypted);

        let wrapped_session_key = session_key
            .wrap_for(&clinician_key)
            .because(FailureReason::UntrustedCertificate)?;
        let sender_pem = self
            .certificate
            .to_pem()
            .because(FailureReason::InvalidPayload)?;
        let envelope = AppointmentEnvelope {
            wrapped_session_key,
            sealed,
            signature,
            sender_certificate: String::from_utf8_lossy(&sender_pem).into_owned(),
        };
        self.session_key = Some(session_key);
        self.clinician_key = Some(clinician_key);
        self.progress.advance(ExchangeState::Sent);
        Ok(envelope)
    }

    /// Open and check the clinician's confirmation.
    ///
    /// # Errors
    /// `SignatureMismatch` if the clinician did not sign it;
    /// `IdentifierMismatch` if it confirms a different appointment. Either
    /// leaves the exchange `Failed`.
    pub fn receive_confirmation(
        &mut self,
        envelope: &ConfirmationEnvelope,
    ) -> Result<AppointmentId> {
        self.progress.require(ExchangeState::Sent)?;
        self.progress.advance(ExchangeState::ConfirmationReceived);
        self.try_receive_confirmation(envelope)
            .map_err(|(reason, e)| self.progress.fail(reason, e))
    }

    fn try_receive_confirmation(&mut self, envelope: &ConfirmationEnvelope) -> Step<AppointmentId> {
        let (Some(session_key), Some(clinician_key)) =
            (self.session_key.take(), self.clinician_key.take())
        else {
            return Err((
                FailureReason::DecryptionFailed,
                HealthPkiError::InvalidRequest("exchange holds no session key".to_string()),
            ));
        };

        let plaintext = session_key
            .open(&envelope.sealed, CONFIRMATION_AAD)
            .because(FailureReason::DecryptionFailed)?;

        let signed = keys::verify(&clinician_key, &plaintext, &envelope.signature)
            .because(FailureReason::SignatureMismatch)?;
        if !signed {
            return Err((
                FailureReason::SignatureMismatch,
                HealthPkiError::SignatureMismatch("appointment confirmation".to_string()),
            ));
        }
        self.progress.advance(ExchangeState::ConfirmationVerified);

        let confirmed = match String::from_utf8(plaintext) {
            Ok(id) => AppointmentId::from(id),
            Err(_) => {
                return Err((
                    FailureReason::InvalidPayload,
                    HealthPkiError::InvalidRequest("confirmation is not UTF-8".to_string()),
                ))
            }
        };
        if confirmed != self.expected_id {
            return Err((
                FailureReason::IdentifierMismatch,
                HealthPkiError::IdentifierMismatch {
                    expected: self.expected_id.to_string(),
                    confirmed: confirmed.to_string(),
                },
            ));
        }

        self.progress.advance(ExchangeState::Complete);
        info!(appointment = %confirmed, "appointment exchange complete");
        Ok(confirmed)
    }
}

/// Clinician half of an exchange.
pub struct ClinicianExchange<'a> {
    clinician_id: String,
    key_pair: &'a KeyPair,
    trust: &'a TrustStore,
    session_key: Option<SessionKey>,
    request: Option<AppointmentRequest>,
    progress: Progress,
}

impl<'a> ClinicianExchange<'a> {
    pub fn new(clinician_id: &str, key_pair: &'a KeyPair, trust: &'a TrustStore) -> Self {
        Self {
            clinician_id: clinician_id.to_string(),
            key_pair,
            trust,
            session_key: None,
            request: None,
            progress: Progress::new("clinician"),
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.progress.state
    }

    /// The accepted request, once decrypted and verified.
    pub fn request(&self) -> Option<&AppointmentRequest> {
        self.request.as_ref()
    }

    /// Unwrap, decrypt and verify a patient's request.
    ///
    /// # Errors
    /// `SignatureMismatch` if the request was not signed by the certified
    /// patient. The request is then never acted upon. Any error past the
    /// state check leaves the exchange `Failed`.
    pub fn receive(&mut self, envelope: &AppointmentEnvelope) -> Result<&AppointmentRequest> {
        self.progress.require(ExchangeState::Created)?;
        self.progress.advance(ExchangeState::Received);
        let request = self
            .try_receive(envelope)
            .map_err(|(reason, e)| self.progress.fail(reason, e))?;
        Ok(&*self.request.insert(request))
    }

    fn try_receive(&mut self, envelope: &AppointmentEnvelope) -> Step<AppointmentRequest> {
        let sender = X509::from_pem(envelope.sender_certificate.as_bytes())
            .because(FailureReason::UntrustedCertificate)?;
        self.trust
            .verify_leaf(&sender, AuthorityScope::NationalRegistrar)
            .because(FailureReason::UntrustedCertificate)?;
        let sender_key = sender
            .public_key()
            .because(FailureReason::UntrustedCertificate)?;

        let session_key =
            SessionKey::unwrap_with(&envelope.wrapped_session_key, self.key_pair.private_key())
                .because(FailureReason::DecryptionFailed)?;
        let plaintext = session_key
            .open(&envelope.sealed, REQUEST_AAD)
            .because(FailureReason::DecryptionFailed)?;

        let signed = keys::verify(&sender_key, &plaintext, &envelope.signature)
            .because(FailureReason::SignatureMismatch)?;
        if !signed {
            return Err((
                FailureReason::SignatureMismatch,
                HealthPkiError::SignatureMismatch("appointment request".to_string()),
            ));
        }
        self.progress.advance(ExchangeState::Verified);

        let request = AppointmentRequest::from_canonical_bytes(&plaintext)
            .because(FailureReason::InvalidPayload)?;
        let sender_id = subject_id(&sender);
        if request.patient_id != sender_id || request.clinician_id != self.clinician_id {
            return Err((
                FailureReason::InvalidPayload,
                HealthPkiError::InvalidRequest(format!(
                    "request from {} for {} does not match sender {} and recipient {}",
                    request.patient_id, request.clinician_id, sender_id, self.clinician_id
                )),
            ));
        }

        self.session_key = Some(session_key);
        self.progress.advance(ExchangeState::Decrypted);
        Ok(request)
    }

    /// Confirm the received request with its fingerprint.
    pub fn confirm(&mut self) -> Result<ConfirmationEnvelope> {
        let id = self
            .request
            .as_ref()
            .map(|request| request.fingerprint())
            .ok_or_else(|| {
                HealthPkiError::InvalidRequest("no appointment request received".to_string())
            })?;
        self.confirm_identifier(&id)
    }

    /// Sign and seal `id` as the confirmation.
    pub fn confirm_identifier(&mut self, id: &AppointmentId) -> Result<ConfirmationEnvelope> {
        self.progress.require(ExchangeState::Decrypted)?;
        self.try_confirm(id)
            .map_err(|(reason, e)| self.progress.fail(reason, e))
    }

    fn try_confirm(&mut self, id: &AppointmentId) -> Step<ConfirmationEnvelope> {
        let session_key = self.session_key.take().ok_or_else(|| {
            (
                FailureReason::DecryptionFailed,
                HealthPkiError::InvalidRequest("exchange holds no session key".to_string()),
            )
        })?;

        let plaintext = id.as_str().as_bytes();
        let signature = self
            .key_pair
            .sign(plaintext)
            .because(FailureReason::InvalidPayload)?;
        let sealed = session_key
            .seal(plaintext, CONFIRMATION_AAD)
            .because(FailureReason::InvalidPayload)?;

        self.progress.advance(ExchangeState::ConfirmationSent);
        Ok(ConfirmationEnvelope { sealed, signature })
    }
}
