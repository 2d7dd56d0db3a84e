//! Health Center PKI
//!
//! Bootstraps the certificate hierarchy, registers the demo patients and
//! clinicians on first run and books the demo appointment through the signed
//! and encrypted exchange.
//!
//! # Quick Start
//!
//! ```bash
//! cargo build --release
//! RUST_LOG=debug ./target/release/health-center-pki
//! ```
//!
//! Configuration is read from `config.toml` in the working directory. Without
//! one, defaults are used and data lands under `data/`.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use health_center_pki::appointment::parse_date_time;
use health_center_pki::configs::AppConfig;
use health_center_pki::error::HealthPkiError;
use health_center_pki::health_center::{HealthCenter, NewClinician, NewPatient};
use health_center_pki::key_store::FileKeyStore;
use health_center_pki::subject::Location;

const CONFIG_PATH: &str = "config.toml";

fn demo_patients() -> Vec<NewPatient<'static>> {
    vec![
        NewPatient {
            id: "54026189V",
            full_name: "Lorenzo Largacha Sanz",
            phone: "+34666888166",
            age: 22,
            password: "12345ABC",
            location: Location::default(),
        },
        NewPatient {
            id: "58849111T",
            full_name: "Pedro Hernandez Bernaldo",
            phone: "+34111555888",
            age: 35,
            password: "12345ABC",
            location: Location::default(),
        },
    ]
}

fn demo_clinicians() -> Vec<NewClinician<'static>> {
    let clinician = |id: &'static str,
                     full_name: &'static str,
                     phone: &'static str,
                     age: u32,
                     specialty: &'static str| NewClinician {
        id,
        full_name,
        phone,
        age,
        specialty,
        password: "1234asdf",
        clinic: None,
        location: Location::default(),
    };
    vec![
        clinician("76281872A", "Manuel Fernandez Gil", "+34222444777", 51, "Atencion Primaria"),
        clinician("84202258V", "Isabel Gomez Rivas", "+34333666999", 44, "Pediatria"),
        clinician("92213124Y", "Juan Martin Perez", "+34444777000", 38, "Odontologia"),
        clinician("67720890N", "Candela Martinez Sanchez", "+34555888111", 47, "Matrona"),
    ]
}

/// Treat `AlreadyRegistered` as success so reruns are idempotent.
fn ignore_existing<T>(result: health_center_pki::error::Result<T>) -> Result<()> {
    match result {
        Ok(_) | Err(HealthPkiError::AlreadyRegistered(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether `clinician_id` already has an active appointment at `at`.
fn slot_booked(
    center: &HealthCenter,
    clinician_id: &str,
    at: NaiveDateTime,
) -> health_center_pki::error::Result<bool> {
    Ok(center
        .clinician_schedule(clinician_id, at.date())?
        .iter()
        .any(|appointment| appointment.request.date_time == at))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = if Path::new(CONFIG_PATH).exists() {
        AppConfig::load()?
    } else {
        warn!("{} not found, using defaults", CONFIG_PATH);
        AppConfig::default()
    };

    let key_store = FileKeyStore::new(
        &config.storage.key_directory,
        config.storage.key_passphrase.clone(),
    )
    .context("Failed to open key store")?;
    let center =
        HealthCenter::open(config, Box::new(key_store)).context("Failed to open health center")?;

    for patient in demo_patients() {
        ignore_existing(center.register_patient(&patient))
            .with_context(|| format!("Failed to register patient {}", patient.id))?;
    }
    for clinician in demo_clinicians() {
        ignore_existing(center.register_clinician(&clinician))
            .with_context(|| format!("Failed to register clinician {}", clinician.id))?;
    }

    let at = parse_date_time("2023-10-31 14:30:00")?;
    if slot_booked(&center, "76281872A", at)? {
        info!(at = %at, "demo slot already booked");
    } else {
        let appointment = center
            .request_appointment("54026189V", "76281872A", at, "Dolor de cabeza")
            .context("Failed to book demo appointment")?;
        info!(id = %appointment.id, "demo appointment booked");
    }

    for appointment in center.clinician_schedule("76281872A", at.date())? {
        info!(
            id = %appointment.id,
            at = %appointment.request.date_time,
            patient = %appointment.request.patient_id,
            reason = %appointment.request.reason,
            "scheduled"
        );
    }
    Ok(())
}
