//! Distinguished names for every role in the network
//!
//! A subject is the set of X.509 name attributes bound into a CSR or
//! certificate. End identities carry their national id (DNI/NIE) in the
//! `serialNumber` attribute, which is how certificates are mapped back to
//! patient and clinician records.

use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameRef};

use crate::error::Result;

const DEFAULT_COUNTRY: &str = "ES";
const DEFAULT_STATE: &str = "Madrid";
const DEFAULT_LOCALITY: &str = "Madrid";
const DEFAULT_PATIENT_ORGANIZATION: &str = "Sistema Nacional de Salud";
const DEFAULT_PATIENT_UNIT: &str = "Pacientes";
const DEFAULT_CLINIC: &str = "Centro de Salud";

/// X.509 subject attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAttributes {
    /// National id of an end identity; authorities have none.
    pub id: Option<String>,
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub locality: String,
    pub state: String,
    pub country: String,
}

impl SubjectAttributes {
    /// Build the X.509 name, one entry per attribute.
    pub fn to_x509_name(&self) -> Result<X509Name> {
        let mut name_builder = X509Name::builder()?;
        if let Some(id) = &self.id {
            name_builder.append_entry_by_nid(Nid::SERIALNUMBER, id)?;
        }
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        name_builder.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit)?;
        name_builder.append_entry_by_nid(Nid::LOCALITYNAME, &self.locality)?;
        name_builder.append_entry_by_nid(Nid::STATEORPROVINCENAME, &self.state)?;
        name_builder.append_entry_by_nid(Nid::COUNTRYNAME, &self.country)?;
        Ok(name_builder.build())
    }

    /// Read the attributes back from an X.509 name. Missing entries come
    /// back empty.
    pub fn from_x509_name(name: &X509NameRef) -> Self {
        let id = name_entry(name, Nid::SERIALNUMBER);
        Self {
            id: (!id.is_empty()).then_some(id),
            common_name: name_entry(name, Nid::COMMONNAME),
            organization: name_entry(name, Nid::ORGANIZATIONNAME),
            organizational_unit: name_entry(name, Nid::ORGANIZATIONALUNITNAME),
            locality: name_entry(name, Nid::LOCALITYNAME),
            state: name_entry(name, Nid::STATEORPROVINCENAME),
            country: name_entry(name, Nid::COUNTRYNAME),
        }
    }
}

/// First UTF-8 value stored under `nid`, or an empty string.
pub fn name_entry(name: &X509NameRef, nid: Nid) -> String {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|value| value.to_string())
        .unwrap_or_default()
}

/// Optional location fields shared by every role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
}

/// Role of an identity requesting a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleAttributes {
    Patient {
        id: String,
        full_name: String,
        location: Location,
    },
    Clinician {
        id: String,
        full_name: String,
        specialty: String,
        clinic: Option<String>,
        location: Location,
    },
    /// A subordinate certificate authority.
    Authority(SubjectAttributes),
}

impl RoleAttributes {
    /// Subject id of an end identity.
    pub fn id(&self) -> Option<&str> {
        match self {
            RoleAttributes::Patient { id, .. } | RoleAttributes::Clinician { id, .. } => Some(id),
            RoleAttributes::Authority(subject) => subject.id.as_deref(),
        }
    }

    /// Expand into subject attributes, filling omitted fields with the
    /// defaults for the role.
    pub fn to_subject(&self) -> SubjectAttributes {
        match self {
            RoleAttributes::Patient {
                id,
                full_name,
                location,
            } => with_location(
                SubjectAttributes {
                    id: Some(id.clone()),
                    common_name: full_name.clone(),
                    organization: DEFAULT_PATIENT_ORGANIZATION.to_string(),
                    organizational_unit: DEFAULT_PATIENT_UNIT.to_string(),
                    locality: String::new(),
                    state: String::new(),
                    country: String::new(),
                },
                location,
            ),
            RoleAttributes::Clinician {
                id,
                full_name,
                specialty,
                clinic,
                location,
            } => with_location(
                SubjectAttributes {
                    id: Some(id.clone()),
                    common_name: full_name.clone(),
                    organization: clinic.clone().unwrap_or_else(|| DEFAULT_CLINIC.to_string()),
                    organizational_unit: specialty.clone(),
                    locality: String::new(),
                    state: String::new(),
                    country: String::new(),
                },
                location,
            ),
            RoleAttributes::Authority(subject) => subject.clone(),
        }
    }
}

fn with_location(mut subject: SubjectAttributes, location: &Location) -> SubjectAttributes {
    subject.country = location
        .country
        .clone()
        .unwrap_or_else(|| DEFAULT_COUNTRY.to_string());
    subject.state = location
        .state
        .clone()
        .unwrap_or_else(|| DEFAULT_STATE.to_string());
    subject.locality = location
        .locality
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCALITY.to_string());
    subject
}
