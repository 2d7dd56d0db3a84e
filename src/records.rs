//! Patient and clinician records
//!
//! Each identity keeps its own ordered list of appointment summaries. The
//! patient's copy names the clinician and the clinician's copy names the
//! patient; the two are updated independently.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::appointment::{AppointmentId, AppointmentRequest};
use crate::record_store::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentSummary {
    pub id: AppointmentId,
    pub date_time: NaiveDateTime,
    /// The other party: clinician id on a patient record, patient id on a
    /// clinician record.
    pub counterpart_id: String,
    pub reason: String,
}

impl AppointmentSummary {
    pub fn for_patient(request: &AppointmentRequest) -> Self {
        Self {
            id: request.fingerprint(),
            date_time: request.date_time,
            counterpart_id: request.clinician_id.clone(),
            reason: request.reason.clone(),
        }
    }

    pub fn for_clinician(request: &AppointmentRequest) -> Self {
        Self {
            id: request.fingerprint(),
            date_time: request.date_time,
            counterpart_id: request.patient_id.clone(),
            reason: request.reason.clone(),
        }
    }
}

fn remove_summary(appointments: &mut Vec<AppointmentSummary>, id: &AppointmentId) -> bool {
    let before = appointments.len();
    appointments.retain(|summary| &summary.id != id);
    appointments.len() != before
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: String,
    pub full_name: String,
    pub phone: String,
    pub age: u32,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub appointments: Vec<AppointmentSummary>,
}

impl PatientRecord {
    pub fn new(id: &str, full_name: &str, phone: &str, age: u32) -> Self {
        Self {
            id: id.to_string(),
            full_name: full_name.to_string(),
            phone: phone.to_string(),
            age,
            registered_at: Utc::now(),
            appointments: Vec::new(),
        }
    }

    pub fn add_appointment(&mut self, summary: AppointmentSummary) {
        self.appointments.push(summary);
    }

    /// Returns whether a summary was removed.
    pub fn remove_appointment(&mut self, id: &AppointmentId) -> bool {
        remove_summary(&mut self.appointments, id)
    }
}

impl Record for PatientRecord {
    const KIND: &'static str = "patients";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicianRecord {
    pub id: String,
    pub full_name: String,
    pub phone: String,
    pub age: u32,
    pub specialty: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub appointments: Vec<AppointmentSummary>,
}

impl ClinicianRecord {
    pub fn new(id: &str, full_name: &str, phone: &str, age: u32, specialty: &str) -> Self {
        Self {
            id: id.to_string(),
            full_name: full_name.to_string(),
            phone: phone.to_string(),
            age,
            specialty: specialty.to_string(),
            registered_at: Utc::now(),
            appointments: Vec::new(),
        }
    }

    pub fn add_appointment(&mut self, summary: AppointmentSummary) {
        self.appointments.push(summary);
    }

    pub fn remove_appointment(&mut self, id: &AppointmentId) -> bool {
        remove_summary(&mut self.appointments, id)
    }
}

impl Record for ClinicianRecord {
    const KIND: &'static str = "clinicians";

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::parse_date_time;

    fn request() -> AppointmentRequest {
        AppointmentRequest {
            clinician_id: "76281872A".to_string(),
            specialty: "Atencion Primaria".to_string(),
            date_time: parse_date_time("2023-10-31 14:30:00").unwrap(),
            patient_id: "54026189V".to_string(),
            patient_phone: "+34666888166".to_string(),
            reason: "Dolor de cabeza".to_string(),
        }
    }

    #[test]
    fn test_summaries_name_the_counterpart() {
        let req = request();
        assert_eq!(AppointmentSummary::for_patient(&req).counterpart_id, "76281872A");
        assert_eq!(AppointmentSummary::for_clinician(&req).counterpart_id, "54026189V");
    }

    #[test]
    fn test_add_and_remove() {
        let req = request();
        let mut patient = PatientRecord::new("54026189V", "Lorenzo Largacha Sanz", "+34666888166", 22);
        patient.add_appointment(AppointmentSummary::for_patient(&req));
        assert_eq!(patient.appointments.len(), 1);

        assert!(patient.remove_appointment(&req.fingerprint()));
        assert!(!patient.remove_appointment(&req.fingerprint()));
        assert!(patient.appointments.is_empty());
    }

    #[test]
    fn test_copies_are_independent() {
        let req = request();
        let mut patient = PatientRecord::new("54026189V", "Lorenzo Largacha Sanz", "+34666888166", 22);
        let mut clinician = ClinicianRecord::new(
            "76281872A",
            "Manuel Fernandez Gil",
            "+34222444777",
            51,
            "Atencion Primaria",
        );
        patient.add_appointment(AppointmentSummary::for_patient(&req));
        clinician.add_appointment(AppointmentSummary::for_clinician(&req));

        clinician.remove_appointment(&req.fingerprint());
        assert_eq!(patient.appointments.len(), 1);
        assert!(clinician.appointments.is_empty());
    }
}
