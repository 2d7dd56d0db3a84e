//! Health center facade
//!
//! Owns the trust hierarchy, the record stores and the credential vault, and
//! runs both halves of the appointment exchange in process. An appointment is
//! persisted only after the patient has verified the clinician's confirmation.

use chrono::{NaiveDate, NaiveDateTime};
use openssl::x509::X509;
use tracing::{info, warn};

use crate::appointment::{self, Appointment, AppointmentId, AppointmentRequest};
use crate::certificate_authority::CertificateAuthority;
use crate::configs::AppConfig;
use crate::credentials::CredentialVault;
use crate::error::{HealthPkiError, Result};
use crate::hierarchy::{TrustHierarchy, TrustStore};
use crate::key_store::{certificate_handle, private_key_handle, KeyMaterialStore};
use crate::keys::KeyPair;
use crate::protocol::{decode_message, encode_message, ConfirmationEnvelope, Message};
use crate::record_store::JsonFileStore;
use crate::records::{AppointmentSummary, ClinicianRecord, PatientRecord};
use crate::registrar::IdentityRegistrar;
use crate::secure_channel::{ClinicianExchange, PatientExchange};
use crate::subject::{Location, RoleAttributes};

/// Registration data of a new patient.
#[derive(Debug, Clone)]
pub struct NewPatient<'a> {
    pub id: &'a str,
    pub full_name: &'a str,
    pub phone: &'a str,
    pub age: u32,
    pub password: &'a str,
    pub location: Location,
}

/// Registration data of a new clinician.
#[derive(Debug, Clone)]
pub struct NewClinician<'a> {
    pub id: &'a str,
    pub full_name: &'a str,
    pub phone: &'a str,
    pub age: u32,
    pub specialty: &'a str,
    pub password: &'a str,
    pub clinic: Option<&'a str>,
    pub location: Location,
}

pub struct HealthCenter {
    config: AppConfig,
    key_store: Box<dyn KeyMaterialStore>,
    authority: CertificateAuthority,
    hierarchy: TrustHierarchy,
    trust: TrustStore,
    patients: JsonFileStore<PatientRecord>,
    clinicians: JsonFileStore<ClinicianRecord>,
    appointments: JsonFileStore<Appointment>,
    credentials: CredentialVault,
}

impl HealthCenter {
    /// Load or create the trust hierarchy in `key_store` and open the record
    /// stores under `config.storage.record_directory`.
    pub fn open(config: AppConfig, key_store: Box<dyn KeyMaterialStore>) -> Result<Self> {
        let authority = CertificateAuthority::new(config.crypto.rsa_key_bits);
        let hierarchy = TrustHierarchy::bootstrap(&authority, key_store.as_ref(), &config)?;
        let trust = hierarchy.trust_store();

        let records = config.storage.record_directory.as_path();
        let patients = JsonFileStore::open(records)?;
        let clinicians = JsonFileStore::open(records)?;
        let appointments = JsonFileStore::open(records)?;
        let credentials = CredentialVault::open(records, config.crypto.pbkdf2_iterations)?;

        info!(records = %records.display(), "health center open");
        Ok(Self {
            config,
            key_store,
            authority,
            hierarchy,
            trust,
            patients,
            clinicians,
            appointments,
            credentials,
        })
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    pub fn key_store(&self) -> &dyn KeyMaterialStore {
        self.key_store.as_ref()
    }

    fn registrar(&self) -> IdentityRegistrar<'_> {
        IdentityRegistrar::new(
            &self.authority,
            &self.hierarchy,
            self.key_store.as_ref(),
            self.config.crypto.rsa_key_bits,
            self.config.leaf.validity_days,
        )
    }

    /// Enroll a patient certificate and store the record and password.
    ///
    /// # Errors
    /// `AlreadyRegistered` if the id is known.
    pub fn register_patient(&self, patient: &NewPatient<'_>) -> Result<PatientRecord> {
        if self.patients.find_by_id(patient.id)?.is_some() {
            return Err(HealthPkiError::AlreadyRegistered(patient.id.to_string()));
        }
        self.registrar().enroll(&RoleAttributes::Patient {
            id: patient.id.to_string(),
            full_name: patient.full_name.to_string(),
            location: patient.location.clone(),
        })?;

        let record = PatientRecord::new(patient.id, patient.full_name, patient.phone, patient.age);
        self.complete_registration(patient.id, patient.password, || {
            self.patients.insert(record.clone())
        })?;
        info!(id = patient.id, "registered patient");
        Ok(record)
    }

    /// Enroll a clinician certificate and store the record and password.
    ///
    /// # Errors
    /// `AlreadyRegistered` if the id is known.
    pub fn register_clinician(&self, clinician: &NewClinician<'_>) -> Result<ClinicianRecord> {
        if self.clinicians.find_by_id(clinician.id)?.is_some() {
            return Err(HealthPkiError::AlreadyRegistered(clinician.id.to_string()));
        }
        self.registrar().enroll(&RoleAttributes::Clinician {
            id: clinician.id.to_string(),
            full_name: clinician.full_name.to_string(),
            specialty: clinician.specialty.to_string(),
            clinic: clinician.clinic.map(str::to_string),
            location: clinician.location.clone(),
        })?;

        let record = ClinicianRecord::new(
            clinician.id,
            clinician.full_name,
            clinician.phone,
            clinician.age,
            clinician.specialty,
        );
        self.complete_registration(clinician.id, clinician.password, || {
            self.clinicians.insert(record.clone())
        })?;
        info!(id = clinician.id, specialty = clinician.specialty, "registered clinician");
        Ok(record)
    }

    /// Store the password and then the record of a freshly enrolled `id`.
    ///
    /// On failure the key material and password are released again, so the id
    /// can be registered later instead of being left half known.
    fn complete_registration(
        &self,
        id: &str,
        password: &str,
        insert_record: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let stored = self
            .credentials
            .register(id, password)
            .and_then(|()| insert_record());
        if let Err(e) = stored {
            warn!(id, error = %e, "registration incomplete, releasing identity");
            if let Err(cleanup) = self.key_store.remove_identity(id) {
                warn!(id, error = %cleanup, "failed to release key material");
            }
            if let Err(cleanup) = self.credentials.remove(id) {
                warn!(id, error = %cleanup, "failed to release credentials");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Password login, independent of certificates.
    pub fn authenticate(&self, id: &str, password: &str) -> Result<bool> {
        self.credentials.verify(id, password)
    }

    pub fn patient(&self, id: &str) -> Result<PatientRecord> {
        self.patients
            .find_by_id(id)?
            .ok_or_else(|| HealthPkiError::NotFound(format!("patient {}", id)))
    }

    pub fn clinician(&self, id: &str) -> Result<ClinicianRecord> {
        self.clinicians
            .find_by_id(id)?
            .ok_or_else(|| HealthPkiError::NotFound(format!("clinician {}", id)))
    }

    pub fn appointment(&self, id: &AppointmentId) -> Result<Appointment> {
        self.appointments
            .find_by_id(id.as_str())?
            .ok_or_else(|| HealthPkiError::NotFound(format!("appointment {}", id)))
    }

    fn identity(&self, id: &str) -> Result<(KeyPair, X509)> {
        Ok((
            self.key_store.load_private_key(&private_key_handle(id))?,
            self.key_store.load_certificate(&certificate_handle(id))?,
        ))
    }

    /// Book an appointment through the signed and encrypted exchange.
    pub fn request_appointment(
        &self,
        patient_id: &str,
        clinician_id: &str,
        date_time: NaiveDateTime,
        reason: &str,
    ) -> Result<Appointment> {
        self.request_appointment_with(patient_id, clinician_id, date_time, reason, |clinician| {
            clinician.confirm()
        })
    }

    /// Like [`HealthCenter::request_appointment`], with the clinician's
    /// confirmation step supplied by the caller.
    pub fn request_appointment_with<F>(
        &self,
        patient_id: &str,
        clinician_id: &str,
        date_time: NaiveDateTime,
        reason: &str,
        confirm: F,
    ) -> Result<Appointment>
    where
        F: FnOnce(&mut ClinicianExchange<'_>) -> Result<ConfirmationEnvelope>,
    {
        let patient = self.patient(patient_id)?;
        let clinician = self.clinician(clinician_id)?;
        if appointment::slot_taken(&self.appointments.all()?, clinician_id, date_time) {
            return Err(slot_taken_error(clinician_id, date_time));
        }

        let request = AppointmentRequest {
            clinician_id: clinician.id.clone(),
            specialty: clinician.specialty.clone(),
            date_time,
            patient_id: patient.id.clone(),
            patient_phone: patient.phone.clone(),
            reason: reason.to_string(),
        };

        let (patient_key, patient_certificate) = self.identity(patient_id)?;
        let (clinician_key, clinician_certificate) = self.identity(clinician_id)?;
        let mut patient_side =
            PatientExchange::new(request, &patient_key, &patient_certificate, &self.trust);
        let mut clinician_side = ClinicianExchange::new(clinician_id, &clinician_key, &self.trust);

        let frame = encode_message(&Message::AppointmentRequest(
            patient_side.send(&clinician_certificate)?,
        ))?;
        let Message::AppointmentRequest(envelope) = decode_message(&frame)? else {
            return Err(HealthPkiError::InvalidRequest(
                "expected an appointment request".to_string(),
            ));
        };

        // The clinician records the request before confirming it.
        let received = AppointmentSummary::for_clinician(clinician_side.receive(&envelope)?);
        let received_id = received.id.clone();
        self.clinicians
            .modify(clinician_id, |record| record.add_appointment(received))?;

        let confirmed = confirm(&mut clinician_side)
            .and_then(|confirmation| {
                encode_message(&Message::AppointmentConfirmation(confirmation))
            })
            .and_then(|frame| match decode_message(&frame)? {
                Message::AppointmentConfirmation(confirmation) => {
                    patient_side.receive_confirmation(&confirmation)
                }
                Message::AppointmentRequest(_) => Err(HealthPkiError::InvalidRequest(
                    "expected an appointment confirmation".to_string(),
                )),
            });
        let booked =
            confirmed.and_then(|_| self.book(Appointment::new(patient_side.request().clone())));
        let appointment = match booked {
            Ok(appointment) => appointment,
            Err(e) => {
                warn!(appointment = %received_id, error = %e, "discarding appointment request");
                self.clinicians.modify(clinician_id, |record| {
                    record.remove_appointment(&received_id);
                })?;
                return Err(e);
            }
        };
        let summary = AppointmentSummary::for_patient(&appointment.request);
        self.patients
            .modify(patient_id, |record| record.add_appointment(summary))?;

        info!(
            appointment = %appointment.id,
            patient = patient_id,
            clinician = clinician_id,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Store `appointment` unless its slot is taken, reactivating a cancelled
    /// record with the same id. The slot check and the write share one lock.
    fn book(&self, appointment: Appointment) -> Result<Appointment> {
        self.appointments.transact(|records| {
            let request = &appointment.request;
            if appointment::slot_taken(records.iter(), &request.clinician_id, request.date_time) {
                return Err(slot_taken_error(&request.clinician_id, request.date_time));
            }
            match records.iter_mut().find(|stored| stored.id == appointment.id) {
                Some(stored) => *stored = appointment.clone(),
                None => records.push(appointment.clone()),
            }
            Ok(appointment)
        })
    }

    /// Cancel an active appointment and drop it from both parties' lists.
    pub fn cancel_appointment(&self, id: &AppointmentId) -> Result<Appointment> {
        let current = self.appointment(id)?;
        if !current.is_active() {
            return Err(HealthPkiError::InvalidRequest(format!(
                "appointment {} is already cancelled",
                id
            )));
        }
        let cancelled = self.appointments.modify(id.as_str(), Appointment::cancel)?;
        self.patients
            .modify(&cancelled.request.patient_id, |record| {
                record.remove_appointment(id);
            })?;
        self.clinicians
            .modify(&cancelled.request.clinician_id, |record| {
                record.remove_appointment(id);
            })?;
        info!(appointment = %id, "appointment cancelled");
        Ok(cancelled)
    }

    /// Active appointments of `clinician_id` on `date`, earliest first.
    pub fn clinician_schedule(&self, clinician_id: &str, date: NaiveDate) -> Result<Vec<Appointment>> {
        let all = self.appointments.all()?;
        Ok(appointment::clinician_schedule(&all, clinician_id, date)
            .into_iter()
            .cloned()
            .collect())
    }
}

fn slot_taken_error(clinician_id: &str, date_time: NaiveDateTime) -> HealthPkiError {
    HealthPkiError::InvalidRequest(format!(
        "{} already has an appointment at {}",
        clinician_id,
        date_time.format(appointment::DATE_TIME_FORMAT)
    ))
}
