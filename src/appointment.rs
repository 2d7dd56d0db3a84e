//! Appointments and their content-derived identifiers
//!
//! An appointment's identifier is the SHA-256 fingerprint of its core fields,
//! hashed in a fixed order, each preceded by its byte length as a big-endian
//! `u64`:
//!
//! ```text
//! clinician id | specialty | date/time | patient id | reason
//! ```
//!
//! Patient and clinician compute it independently, which is what lets the
//! confirmation round trip be checked without a shared counter.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HealthPkiError, Result};
use crate::record_store::Record;

/// Wire and storage format of appointment date/times.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `YYYY-MM-DD HH:MM:SS` date/time.
pub fn parse_date_time(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), DATE_TIME_FORMAT).map_err(|e| {
        HealthPkiError::InvalidRequest(format!("invalid date/time '{}': {}", value, e))
    })
}

mod date_time_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::DATE_TIME_FORMAT;

    pub fn serialize<S>(date_time: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date_time.format(DATE_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, DATE_TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Hex SHA-256 fingerprint identifying an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(String);

impl AppointmentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AppointmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a patient sends to book a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRequest {
    pub clinician_id: String,
    pub specialty: String,
    #[serde(with = "date_time_format")]
    pub date_time: NaiveDateTime,
    pub patient_id: String,
    pub patient_phone: String,
    pub reason: String,
}

impl AppointmentRequest {
    /// Serialized form that gets signed and encrypted. Field order is fixed by
    /// the struct definition.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn fingerprint(&self) -> AppointmentId {
        let date_time = self.date_time.format(DATE_TIME_FORMAT).to_string();
        let mut hasher = Sha256::new();
        for field in [
            self.clinician_id.as_str(),
            self.specialty.as_str(),
            date_time.as_str(),
            self.patient_id.as_str(),
            self.reason.as_str(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        AppointmentId(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Active,
    Cancelled,
}

/// A booked appointment as persisted after a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub request: AppointmentRequest,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn new(request: AppointmentRequest) -> Self {
        Self {
            id: request.fingerprint(),
            request,
            status: AppointmentStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AppointmentStatus::Active
    }

    pub fn cancel(&mut self) {
        self.status = AppointmentStatus::Cancelled;
    }
}

impl Record for Appointment {
    const KIND: &'static str = "appointments";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

/// Active appointments of `clinician_id` on `date`, earliest first.
pub fn clinician_schedule<'a>(
    appointments: impl IntoIterator<Item = &'a Appointment>,
    clinician_id: &str,
    date: NaiveDate,
) -> Vec<&'a Appointment> {
    let mut schedule: Vec<&Appointment> = appointments
        .into_iter()
        .filter(|a| {
            a.is_active() && a.request.clinician_id == clinician_id && a.request.date_time.date() == date
        })
        .collect();
    schedule.sort_by_key(|a| a.request.date_time);
    schedule
}

/// Whether `clinician_id` already has an active appointment at `date_time`.
pub fn slot_taken<'a>(
    appointments: impl IntoIterator<Item = &'a Appointment>,
    clinician_id: &str,
    date_time: NaiveDateTime,
) -> bool {
    appointments.into_iter().any(|a| {
        a.is_active() && a.request.clinician_id == clinician_id && a.request.date_time == date_time
    })
}
