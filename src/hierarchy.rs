//! Trust hierarchy bootstrap
//!
//! The network has one root and two subordinate authorities. Clinicians are
//! certified by the clinic authority and patients by the national registrar
//! (FNMT); the two scopes are never merged.
//!
//! On first start the hierarchy is generated and persisted in the key store
//! under the `root_ca`, `clinic_ca` and `fnmt_ca` identities. Later starts
//! reload it.

use openssl::pkey::{PKeyRef, Private};
use openssl::x509::{X509Ref, X509};
use tracing::{info, warn};

use crate::certificate_authority::{verify_chain_at, CertificateAuthority};
use crate::configs::{AppConfig, AuthorityConfig};
use crate::error::{ChainError, HealthPkiError, Result};
use crate::key_store::{certificate_handle, private_key_handle, public_key_handle, KeyMaterialStore};
use crate::keys::KeyPair;
use crate::pki_generator::unix_now;
use crate::registrar::IdentityRegistrar;
use crate::subject::RoleAttributes;

pub const ROOT_CA_ID: &str = "root_ca";
pub const CLINIC_CA_ID: &str = "clinic_ca";
pub const REGISTRAR_CA_ID: &str = "fnmt_ca";

/// Which subordinate authority certifies an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityScope {
    /// Certifies clinicians.
    Clinic,
    /// National registrar, certifies patients.
    NationalRegistrar,
}

impl AuthorityScope {
    pub fn for_role(role: &RoleAttributes) -> Option<Self> {
        match role {
            RoleAttributes::Patient { .. } => Some(AuthorityScope::NationalRegistrar),
            RoleAttributes::Clinician { .. } => Some(AuthorityScope::Clinic),
            RoleAttributes::Authority(_) => None,
        }
    }

    fn store_id(self) -> &'static str {
        match self {
            AuthorityScope::Clinic => CLINIC_CA_ID,
            AuthorityScope::NationalRegistrar => REGISTRAR_CA_ID,
        }
    }
}

/// A certificate together with the key that signs under it.
pub struct IssuingAuthority {
    certificate: X509,
    key_pair: KeyPair,
}

impl IssuingAuthority {
    pub fn new(certificate: X509, key_pair: KeyPair) -> Self {
        Self {
            certificate,
            key_pair,
        }
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        self.key_pair.private_key()
    }

    fn load(store: &dyn KeyMaterialStore, id: &str) -> Result<Self> {
        Ok(Self {
            certificate: store.load_certificate(&certificate_handle(id))?,
            key_pair: store.load_private_key(&private_key_handle(id))?,
        })
    }

    /// Keys first, certificate last: a stored certificate means the identity
    /// is complete.
    fn persist(&self, store: &dyn KeyMaterialStore, id: &str) -> Result<()> {
        store.save_private_key(&private_key_handle(id), &self.key_pair)?;
        let public_key = self.key_pair.public_key()?;
        store.save_public_key(&public_key_handle(id), &public_key)?;
        store.save_certificate(&certificate_handle(id), &self.certificate)
    }
}

/// Root plus the clinic and national registrar subordinates.
pub struct TrustHierarchy {
    root: IssuingAuthority,
    clinic: IssuingAuthority,
    registrar: IssuingAuthority,
}

impl TrustHierarchy {
    /// Reload the hierarchy from `store`, generating and persisting it first
    /// if the root is not there yet.
    ///
    /// The root certificate is written last. Without it, whatever an earlier
    /// interrupted bootstrap left behind is discarded and the hierarchy is
    /// generated again.
    pub fn bootstrap(
        authority: &CertificateAuthority,
        store: &dyn KeyMaterialStore,
        config: &AppConfig,
    ) -> Result<Self> {
        if store.contains(&certificate_handle(ROOT_CA_ID))? {
            let hierarchy = Self::load(store)?;
            info!("loaded existing trust hierarchy");
            return Ok(hierarchy);
        }

        Self::discard(store)?;
        let hierarchy = Self::generate(authority, store, config)?;
        if let Err(e) = hierarchy.persist(store) {
            warn!(error = %e, "failed to store trust hierarchy");
            Self::discard(store)?;
            return Err(e);
        }
        info!("generated and stored new trust hierarchy");
        Ok(hierarchy)
    }

    fn persist(&self, store: &dyn KeyMaterialStore) -> Result<()> {
        self.clinic.persist(store, CLINIC_CA_ID)?;
        self.registrar.persist(store, REGISTRAR_CA_ID)?;
        self.root.persist(store, ROOT_CA_ID)
    }

    fn discard(store: &dyn KeyMaterialStore) -> Result<()> {
        for id in [ROOT_CA_ID, CLINIC_CA_ID, REGISTRAR_CA_ID] {
            store.remove_identity(id)?;
        }
        Ok(())
    }

    /// Generate a fresh hierarchy without persisting it.
    pub fn generate(
        authority: &CertificateAuthority,
        store: &dyn KeyMaterialStore,
        config: &AppConfig,
    ) -> Result<Self> {
        let (root_key, root_certificate) =
            authority.issue_root_certificate(&config.root_ca.subject(), config.root_ca.validity_days)?;
        let root = IssuingAuthority::new(root_certificate, root_key);

        let bits = config.crypto.rsa_key_bits;
        let clinic = issue_subordinate(authority, store, &root, &config.clinic_ca, bits)?;
        let registrar = issue_subordinate(authority, store, &root, &config.registrar_ca, bits)?;

        Ok(Self {
            root,
            clinic,
            registrar,
        })
    }

    pub fn load(store: &dyn KeyMaterialStore) -> Result<Self> {
        Ok(Self {
            root: IssuingAuthority::load(store, ROOT_CA_ID)?,
            clinic: IssuingAuthority::load(store, AuthorityScope::Clinic.store_id())?,
            registrar: IssuingAuthority::load(store, AuthorityScope::NationalRegistrar.store_id())?,
        })
    }

    pub fn root(&self) -> &IssuingAuthority {
        &self.root
    }

    pub fn subordinate(&self, scope: AuthorityScope) -> &IssuingAuthority {
        match scope {
            AuthorityScope::Clinic => &self.clinic,
            AuthorityScope::NationalRegistrar => &self.registrar,
        }
    }

    /// The subordinate that certifies `role`.
    pub fn issuer_for(&self, role: &RoleAttributes) -> Result<&IssuingAuthority> {
        AuthorityScope::for_role(role)
            .map(|scope| self.subordinate(scope))
            .ok_or_else(|| {
                HealthPkiError::InvalidRequest(
                    "subordinate authorities are issued by the root, not enrolled".to_string(),
                )
            })
    }

    /// Certificates only, for verifiers.
    pub fn trust_store(&self) -> TrustStore {
        TrustStore {
            root: self.root.certificate.clone(),
            clinic: self.clinic.certificate.clone(),
            registrar: self.registrar.certificate.clone(),
        }
    }
}

fn issue_subordinate(
    authority: &CertificateAuthority,
    store: &dyn KeyMaterialStore,
    root: &IssuingAuthority,
    config: &AuthorityConfig,
    bits: u32,
) -> Result<IssuingAuthority> {
    let key_pair = store.generate_keypair(bits)?;
    let csr = IdentityRegistrar::build_csr(&RoleAttributes::Authority(config.subject()), &key_pair)?;
    let certificate = authority.issue_subordinate_certificate(
        &csr,
        root.certificate(),
        root.private_key(),
        config.validity_days,
    )?;
    Ok(IssuingAuthority::new(certificate, key_pair))
}

/// Public certificates of the hierarchy, used to verify peers.
#[derive(Clone)]
pub struct TrustStore {
    root: X509,
    clinic: X509,
    registrar: X509,
}

impl TrustStore {
    pub fn new(root: X509, clinic: X509, registrar: X509) -> Self {
        Self {
            root,
            clinic,
            registrar,
        }
    }

    pub fn root(&self) -> &X509Ref {
        &self.root
    }

    pub fn subordinate(&self, scope: AuthorityScope) -> &X509Ref {
        match scope {
            AuthorityScope::Clinic => &self.clinic,
            AuthorityScope::NationalRegistrar => &self.registrar,
        }
    }

    /// Verify that `leaf` chains to the root through the `scope` subordinate.
    pub fn verify_leaf(
        &self,
        leaf: &X509Ref,
        scope: AuthorityScope,
    ) -> std::result::Result<(), ChainError> {
        self.verify_leaf_at(leaf, scope, unix_now())
    }

    pub fn verify_leaf_at(
        &self,
        leaf: &X509Ref,
        scope: AuthorityScope,
        now: i64,
    ) -> std::result::Result<(), ChainError> {
        verify_chain_at(leaf, self.subordinate(scope), &self.root, now)
    }
}
