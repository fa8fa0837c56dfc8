use chrono::{DateTime, Utc};
use log::{debug, info};
use thiserror::Error;

use crate::core::types::{CertificateBundle, StoredCertificateRef};

pub const CERT_DESCRIPTION: &str = "Created by Let's Encrypt Certificate Manager";

/// A certificate entry as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub id: String,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
}

impl StoredCertificate {
    pub fn to_ref(&self) -> StoredCertificateRef {
        StoredCertificateRef {
            id: self.id.clone(),
            name: self.name.clone(),
            current_expiry: self.expires_at,
            issuer: self.issuer.clone(),
        }
    }
}

/// Create/update body. Certificate, chain and key always travel together.
pub struct CertificatePayload<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub certificate_pem: &'a str,
    pub chain_pem: &'a str,
    pub private_key_pem: &'a str,
}

impl<'a> CertificatePayload<'a> {
    pub fn from_bundle(name: &'a str, bundle: &'a CertificateBundle) -> Self {
        Self {
            name,
            description: CERT_DESCRIPTION,
            certificate_pem: &bundle.certificate_pem,
            chain_pem: &bundle.chain_pem,
            private_key_pem: bundle.private_key_pem(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("certificate store unreachable: {0}")]
    StoreUnreachable(String),
    #[error("certificate store refused the credentials")]
    NotAuthorized,
    #[error("more than one certificate is named '{0}'")]
    ConflictingName(String),
    #[error("certificate store rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected certificate store response: {0}")]
    InvalidResponse(String),
}

/// Remote certificate store. Implementations must send the whole payload in
/// one request so a partial write cannot happen.
pub trait CertificateStore: Send + Sync {
    /// Entries whose name matches `name`. The store may match loosely; callers
    /// filter again.
    fn list_certificates(&self, name: &str) -> Result<Vec<StoredCertificate>, StoreError>;
    fn create_certificate(
        &self,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError>;
    fn update_certificate(
        &self,
        id: &str,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError>;
}

/// The single entry named exactly `name`, if any.
pub fn find_by_name(
    store: &dyn CertificateStore,
    name: &str,
) -> Result<Option<StoredCertificate>, StoreError> {
    let mut matches: Vec<StoredCertificate> = store
        .list_certificates(name)?
        .into_iter()
        .filter(|cert| cert.name == name)
        .collect();
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(StoreError::ConflictingName(name.to_string())),
    }
}

/// Creates or updates the certificate called `name` with `bundle`.
pub fn reconcile(
    store: &dyn CertificateStore,
    name: &str,
    bundle: &CertificateBundle,
) -> Result<StoredCertificateRef, StoreError> {
    let payload = CertificatePayload::from_bundle(name, bundle);
    let written = match find_by_name(store, name)? {
        Some(existing) => {
            debug!("[store] updating certificate '{name}' (id {})", existing.id);
            store.update_certificate(&existing.id, &payload)?
        }
        None => {
            debug!("[store] creating certificate '{name}'");
            store.create_certificate(&payload)?
        }
    };

    // Trust the bundle for expiry and issuer; some stores echo stale metadata.
    let stored = StoredCertificateRef {
        id: written.id,
        name: name.to_string(),
        current_expiry: Some(bundle.expires_at),
        issuer: Some(bundle.issuer.clone()),
    };
    info!(
        "[store] certificate '{}' (id {}) now expires {}",
        stored.name, stored.id, bundle.expires_at
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Secret;
    use crate::core::types::tests::self_signed;
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<Vec<StoredCertificate>>,
        writes: Mutex<Vec<(Option<String>, String)>>,
    }

    impl MemoryStore {
        fn with(entries: Vec<StoredCertificate>) -> Self {
            Self {
                entries: Mutex::new(entries),
                ..Default::default()
            }
        }
    }

    impl CertificateStore for MemoryStore {
        fn list_certificates(&self, _name: &str) -> Result<Vec<StoredCertificate>, StoreError> {
            Ok(self.entries.lock().unwrap().clone())
        }

        fn create_certificate(
            &self,
            payload: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((None, payload.name.to_string()));
            let created = StoredCertificate {
                id: "1c99".into(),
                name: payload.name.to_string(),
                expires_at: None,
                issuer: None,
            };
            self.entries.lock().unwrap().push(created.clone());
            Ok(created)
        }

        fn update_certificate(
            &self,
            id: &str,
            payload: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((Some(id.to_string()), payload.name.to_string()));
            Ok(StoredCertificate {
                id: id.to_string(),
                name: payload.name.to_string(),
                expires_at: None,
                issuer: None,
            })
        }
    }

    fn entry(id: &str, name: &str) -> StoredCertificate {
        StoredCertificate {
            id: id.into(),
            name: name.into(),
            expires_at: None,
            issuer: None,
        }
    }

    fn bundle() -> CertificateBundle {
        let (cert, key) = self_signed(&["example.com"], Utc::now() + Duration::days(90));
        CertificateBundle::from_pem(&cert, Secret::new(key)).expect("bundle")
    }

    #[test]
    fn creates_when_missing() {
        let store = MemoryStore::default();
        let bundle = bundle();
        let stored = reconcile(&store, "[LE] example.com", &bundle).expect("reconcile");
        assert_eq!(stored.id, "1c99");
        assert_eq!(stored.current_expiry, Some(bundle.expires_at));
        assert_eq!(
            store.writes.lock().unwrap().as_slice(),
            &[(None, "[LE] example.com".to_string())]
        );
    }

    #[test]
    fn updates_existing_by_id() {
        let store = MemoryStore::with(vec![entry("1c7", "[LE] example.com")]);
        let stored = reconcile(&store, "[LE] example.com", &bundle()).expect("reconcile");
        assert_eq!(stored.id, "1c7");
        assert_eq!(
            store.writes.lock().unwrap().as_slice(),
            &[(Some("1c7".to_string()), "[LE] example.com".to_string())]
        );
    }

    #[test]
    fn name_match_is_case_sensitive() {
        let store = MemoryStore::with(vec![entry("1c7", "[le] EXAMPLE.com")]);
        let stored = reconcile(&store, "[LE] example.com", &bundle()).expect("reconcile");
        assert_eq!(stored.id, "1c99");
    }

    #[test]
    fn duplicate_names_conflict_without_writing() {
        let store = MemoryStore::with(vec![
            entry("1c7", "[LE] example.com"),
            entry("1c8", "[LE] example.com"),
        ]);
        let err = reconcile(&store, "[LE] example.com", &bundle()).expect_err("conflict");
        assert_eq!(err, StoreError::ConflictingName("[LE] example.com".into()));
        assert!(store.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn payload_carries_key_and_description() {
        let bundle = bundle();
        let payload = CertificatePayload::from_bundle("name", &bundle);
        assert_eq!(payload.description, CERT_DESCRIPTION);
        assert!(payload.private_key_pem.contains("PRIVATE KEY"));
        assert!(payload.certificate_pem.contains("BEGIN CERTIFICATE"));
    }
}
