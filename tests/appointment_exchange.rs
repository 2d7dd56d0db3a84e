//! End-to-end appointment exchange over a freshly bootstrapped hierarchy.

use health_center_pki::appointment::{parse_date_time, AppointmentId, AppointmentRequest};
use health_center_pki::certificate_authority::{verify_chain, CertificateAuthority};
use health_center_pki::configs::AppConfig;
use health_center_pki::error::HealthPkiError;
use health_center_pki::health_center::{HealthCenter, NewClinician, NewPatient};
use health_center_pki::hierarchy::{AuthorityScope, TrustHierarchy};
use health_center_pki::key_store::{FileKeyStore, KeyMaterialStore, MemoryKeyStore};
use health_center_pki::registrar::IdentityRegistrar;
use health_center_pki::secure_channel::{
    ClinicianExchange, ExchangeState, FailureReason, PatientExchange,
};
use health_center_pki::subject::{Location, RoleAttributes};
use openssl::hash::MessageDigest;
use openssl::x509::X509Req;
use tempfile::TempDir;

const PATIENT: &str = "54026189V";
const CLINICIAN: &str = "76281872A";
const WHEN: &str = "2023-10-31 14:30:00";
const REASON: &str = "Dolor de cabeza";

fn config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.key_directory = dir.path().join("keys");
    config.storage.record_directory = dir.path().join("records");
    config.crypto.pbkdf2_iterations = 1_000;
    config
}

fn open_center(dir: &TempDir) -> HealthCenter {
    let config = config(dir);
    let key_store = FileKeyStore::new(&config.storage.key_directory, None).unwrap();
    HealthCenter::open(config, Box::new(key_store)).unwrap()
}

fn register_parties(center: &HealthCenter) {
    center
        .register_patient(&NewPatient {
            id: PATIENT,
            full_name: "Lorenzo Largacha Sanz",
            phone: "+34666888166",
            age: 22,
            password: "12345ABC",
            location: Location::default(),
        })
        .unwrap();
    center
        .register_clinician(&NewClinician {
            id: CLINICIAN,
            full_name: "Manuel Fernandez Gil",
            phone: "+34222444777",
            age: 51,
            specialty: "Atencion Primaria",
            password: "1234asdf",
            clinic: None,
            location: Location::default(),
        })
        .unwrap();
}

#[test]
fn test_end_to_end_booking() {
    let dir = TempDir::new().unwrap();
    let center = open_center(&dir);
    register_parties(&center);

    // Each leaf chains to the root through the authority of its role.
    let store = center.key_store();
    let trust = center.trust_store();
    let patient_cert = store.load_certificate("54026189V_cert").unwrap();
    let clinician_cert = store.load_certificate("76281872A_cert").unwrap();
    verify_chain(
        &patient_cert,
        trust.subordinate(AuthorityScope::NationalRegistrar),
        trust.root(),
    )
    .unwrap();
    verify_chain(
        &clinician_cert,
        trust.subordinate(AuthorityScope::Clinic),
        trust.root(),
    )
    .unwrap();

    let at = parse_date_time(WHEN).unwrap();
    let appointment = center
        .request_appointment(PATIENT, CLINICIAN, at, REASON)
        .unwrap();

    let recomputed = AppointmentRequest {
        clinician_id: CLINICIAN.to_string(),
        specialty: "Atencion Primaria".to_string(),
        date_time: at,
        patient_id: PATIENT.to_string(),
        patient_phone: "+34666888166".to_string(),
        reason: REASON.to_string(),
    }
    .fingerprint();
    assert_eq!(appointment.id, recomputed);

    let patient = center.patient(PATIENT).unwrap();
    let clinician = center.clinician(CLINICIAN).unwrap();
    assert_eq!(patient.appointments[0].id, clinician.appointments[0].id);
    assert_eq!(patient.appointments[0].counterpart_id, CLINICIAN);
    assert_eq!(clinician.appointments[0].counterpart_id, PATIENT);
}

#[test]
fn test_hierarchy_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let center = open_center(&dir);
        register_parties(&center);
    }

    let center = open_center(&dir);
    assert!(center.authenticate(PATIENT, "12345ABC").unwrap());
    center
        .request_appointment(PATIENT, CLINICIAN, parse_date_time(WHEN).unwrap(), REASON)
        .unwrap();
}

#[test]
fn test_identifier_mismatch_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let center = open_center(&dir);
    register_parties(&center);

    let forged = AppointmentId::from("00".repeat(32));
    let result = center.request_appointment_with(
        PATIENT,
        CLINICIAN,
        parse_date_time(WHEN).unwrap(),
        REASON,
        |clinician| clinician.confirm_identifier(&forged),
    );

    assert!(matches!(
        result,
        Err(HealthPkiError::IdentifierMismatch { .. })
    ));
    assert!(center.patient(PATIENT).unwrap().appointments.is_empty());
    assert!(center.clinician(CLINICIAN).unwrap().appointments.is_empty());
    assert!(center
        .clinician_schedule(CLINICIAN, parse_date_time(WHEN).unwrap().date())
        .unwrap()
        .is_empty());
}

#[test]
fn test_identifier_mismatch_fails_patient_side() {
    let store = MemoryKeyStore::new();
    let authority = CertificateAuthority::new(2048);
    let hierarchy = TrustHierarchy::generate(&authority, &store, &AppConfig::default()).unwrap();
    let trust = hierarchy.trust_store();
    let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);

    let patient = registrar
        .enroll(&RoleAttributes::Patient {
            id: PATIENT.to_string(),
            full_name: "Lorenzo Largacha Sanz".to_string(),
            location: Location::default(),
        })
        .unwrap();
    let clinician = registrar
        .enroll(&RoleAttributes::Clinician {
            id: CLINICIAN.to_string(),
            full_name: "Manuel Fernandez Gil".to_string(),
            specialty: "Atencion Primaria".to_string(),
            clinic: None,
            location: Location::default(),
        })
        .unwrap();

    let request = AppointmentRequest {
        clinician_id: CLINICIAN.to_string(),
        specialty: "Atencion Primaria".to_string(),
        date_time: parse_date_time(WHEN).unwrap(),
        patient_id: PATIENT.to_string(),
        patient_phone: "+34666888166".to_string(),
        reason: REASON.to_string(),
    };
    let mut patient_side =
        PatientExchange::new(request, &patient.key_pair, &patient.certificate, &trust);
    let mut clinician_side = ClinicianExchange::new(CLINICIAN, &clinician.key_pair, &trust);

    let envelope = patient_side.send(&clinician.certificate).unwrap();
    clinician_side.receive(&envelope).unwrap();
    let confirmation = clinician_side
        .confirm_identifier(&AppointmentId::from("f".repeat(64)))
        .unwrap();

    assert!(patient_side.receive_confirmation(&confirmation).is_err());
    assert_eq!(
        patient_side.state(),
        ExchangeState::Failed(FailureReason::IdentifierMismatch)
    );
}

#[test]
fn test_forged_csr_produces_no_certificate() {
    let store = MemoryKeyStore::new();
    let authority = CertificateAuthority::new(2048);
    let hierarchy = TrustHierarchy::generate(&authority, &store, &AppConfig::default()).unwrap();
    let registrar = IdentityRegistrar::new(&authority, &hierarchy, &store, 2048, 365);

    let role = RoleAttributes::Patient {
        id: PATIENT.to_string(),
        full_name: "Lorenzo Largacha Sanz".to_string(),
        location: Location::default(),
    };
    let claimed = store.generate_keypair(2048).unwrap();
    let signer = store.generate_keypair(2048).unwrap();

    let mut builder = X509Req::builder().unwrap();
    builder
        .set_subject_name(&role.to_subject().to_x509_name().unwrap())
        .unwrap();
    builder.set_pubkey(&claimed.public_key().unwrap()).unwrap();
    builder
        .sign(signer.private_key(), MessageDigest::sha256())
        .unwrap();

    let issued_before = authority.issued_count();
    let result = registrar.request_certificate(
        &builder.build(),
        hierarchy.subordinate(AuthorityScope::NationalRegistrar),
    );
    assert!(matches!(result, Err(HealthPkiError::InvalidSignature(_))));
    assert_eq!(authority.issued_count(), issued_before);
    assert!(!store.contains("54026189V_cert").unwrap());
}
