#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use acme_cert_renewer::core::config::{ConfigError, Configuration};
use acme_cert_renewer::core::shutdown::ShutdownSignal;
use acme_cert_renewer::core::types::{CertificateBundle, KeyType, Secret, inspect_certificate};
use acme_cert_renewer::distribution::store::{
    CertificatePayload, CertificateStore, StoreError, StoredCertificate,
};
use acme_cert_renewer::issuance::dns::{DnsPropagationResult, PropagationChecker, PropagationState};
use acme_cert_renewer::issuance::dns_providers::{ChallengeError, DnsChallengeAdapter};
use acme_cert_renewer::issuance::flow::AcmeIssuanceClient;
use acme_cert_renewer::issuance::issuer::{
    CertificateIssuer, IssuanceChallenge, IssuanceError, Issuer, IssuerError, OrderHandle,
};

pub const PRODUCTION_ISSUER_ORG: &str = "Let's Encrypt";

pub fn base_env() -> HashMap<String, String> {
    [
        ("CATTLE_URL", "http://rancher:8080/v2-beta/projects/1a5"),
        ("CATTLE_ACCESS_KEY", "access"),
        ("CATTLE_SECRET_KEY", "secret"),
        ("EULA", "Yes"),
        ("API_VERSION", "Production"),
        ("EMAIL", "ops@example.com"),
        ("DOMAINS", "example.com,www.example.com"),
        ("PUBLIC_KEY_TYPE", "ECDSA-256"),
        ("RENEWAL_TIME", "3"),
        ("PROVIDER", "CloudFlare"),
        ("CLOUDFLARE_API_TOKEN", "cf-token"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn load(vars: &HashMap<String, String>) -> Result<Configuration, ConfigError> {
    Configuration::from_lookup(|name| vars.get(name).cloned())
}

/// Configuration from the base environment with `overrides` applied. An empty
/// override value removes the variable.
pub fn config(overrides: &[(&str, &str)]) -> Arc<Configuration> {
    let mut vars = base_env();
    for (key, value) in overrides {
        if value.is_empty() {
            vars.remove(*key);
        } else {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    Arc::new(load(&vars).expect("valid configuration"))
}

/// Self-signed certificate whose issuer DN looks like the production CA.
pub fn issue_pem(domains: &[String], not_after: DateTime<Utc>) -> (String, String) {
    let mut params = CertificateParams::new(domains.to_vec()).expect("params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, PRODUCTION_ISSUER_ORG);
    dn.push(DnType::CommonName, "Test R3");
    params.distinguished_name = dn;
    let date = not_after.date_naive();
    params.not_after = rcgen::date_time_ymd(date.year(), date.month() as u8, date.day() as u8);
    let key = KeyPair::generate().expect("key");
    let cert = params.self_signed(&key).expect("cert");
    (cert.pem(), key.serialize_pem())
}

pub fn bundle(domains: &[String], not_after: DateTime<Utc>) -> CertificateBundle {
    let (cert, key) = issue_pem(domains, not_after);
    CertificateBundle::from_pem(&cert, Secret::new(key)).expect("bundle")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Create { name: String },
    Update { id: String, name: String },
}

#[derive(Default)]
pub struct StoreState {
    pub entries: Vec<StoredCertificate>,
    pub writes: Vec<StoreWrite>,
    pub payload_had_key: Vec<bool>,
    pub fail_lookup: Option<StoreError>,
    pub fail_write: Option<StoreError>,
    next_id: u32,
}

/// In-memory certificate store shared between the test and the orchestrator.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn with_entry(id: &str, name: &str, pem: &str) -> Self {
        let store = Self::default();
        let info = inspect_certificate(pem).expect("stored pem");
        store.state.lock().unwrap().entries.push(StoredCertificate {
            id: id.to_string(),
            name: name.to_string(),
            expires_at: Some(info.not_after),
            issuer: Some(info.issuer),
        });
        store
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn entries(&self) -> Vec<StoredCertificate> {
        self.state.lock().unwrap().entries.clone()
    }

    fn record(&self, id: String, payload: &CertificatePayload<'_>) -> StoredCertificate {
        let info = inspect_certificate(payload.certificate_pem).expect("payload pem");
        StoredCertificate {
            id,
            name: payload.name.to_string(),
            expires_at: Some(info.not_after),
            issuer: Some(info.issuer),
        }
    }
}

impl CertificateStore for MemoryStore {
    fn list_certificates(&self, _name: &str) -> Result<Vec<StoredCertificate>, StoreError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_lookup {
            return Err(err.clone());
        }
        Ok(state.entries.clone())
    }

    fn create_certificate(
        &self,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_write {
            return Err(err.clone());
        }
        state.next_id += 1;
        let created = self.record(format!("1c{}", 100 + state.next_id), payload);
        state.writes.push(StoreWrite::Create {
            name: payload.name.to_string(),
        });
        state
            .payload_had_key
            .push(payload.private_key_pem.contains("PRIVATE KEY"));
        state.entries.push(created.clone());
        Ok(created)
    }

    fn update_certificate(
        &self,
        id: &str,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_write {
            return Err(err.clone());
        }
        let updated = self.record(id.to_string(), payload);
        state.writes.push(StoreWrite::Update {
            id: id.to_string(),
            name: payload.name.to_string(),
        });
        state
            .payload_had_key
            .push(payload.private_key_pem.contains("PRIVATE KEY"));
        for entry in state.entries.iter_mut().filter(|e| e.id == id) {
            *entry = updated.clone();
        }
        Ok(updated)
    }
}

#[derive(Default)]
pub struct DnsJournal {
    pub presented: Vec<(String, String)>,
    pub cleaned: Vec<(String, String)>,
}

/// DNS adapter that records calls and can refuse one domain.
#[derive(Clone, Default)]
pub struct RecordingDns {
    pub journal: Arc<Mutex<DnsJournal>>,
    pub fail_for: Option<String>,
}

impl DnsChallengeAdapter for RecordingDns {
    fn provider(&self) -> &'static str {
        "recording"
    }

    fn present(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        if self.fail_for.as_deref() == Some(domain) {
            return Err(ChallengeError::Rejected {
                provider: "recording",
                message: "zone is locked".into(),
            });
        }
        self.journal
            .lock()
            .unwrap()
            .presented
            .push((domain.to_string(), token.to_string()));
        Ok(())
    }

    fn clean_up(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        self.journal
            .lock()
            .unwrap()
            .cleaned
            .push((domain.to_string(), token.to_string()));
        Ok(())
    }
}

pub struct InstantPropagation;

impl PropagationChecker for InstantPropagation {
    fn wait_for_record(
        &self,
        _record_name: &str,
        _expected_value: &str,
        _shutdown: &ShutdownSignal,
    ) -> anyhow::Result<DnsPropagationResult> {
        Ok(DnsPropagationResult {
            state: PropagationState::Found,
            reason: None,
            observed_values: Vec::new(),
        })
    }
}

/// ACME server stand-in: one pending DNS-01 challenge per domain, finalize
/// issues a certificate valid until `expires_at`.
pub struct ScriptedAcme {
    pub domains: Mutex<Vec<String>>,
    pub expires_at: DateTime<Utc>,
    pub orders: Arc<Mutex<u32>>,
}

impl ScriptedAcme {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            domains: Mutex::new(Vec::new()),
            expires_at,
            orders: Arc::new(Mutex::new(0)),
        }
    }
}

impl Issuer for ScriptedAcme {
    fn ensure_account(&self) -> Result<(), IssuerError> {
        Ok(())
    }

    fn begin_order(&self, domains: &[String]) -> Result<OrderHandle, IssuerError> {
        *self.domains.lock().unwrap() = domains.to_vec();
        let mut orders = self.orders.lock().unwrap();
        *orders += 1;
        Ok(OrderHandle {
            id: format!("order-{orders}"),
        })
    }

    fn get_challenges(&self, _order: &OrderHandle) -> Result<Vec<IssuanceChallenge>, IssuerError> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, domain)| IssuanceChallenge {
                id: i.to_string(),
                domain: domain.clone(),
                txt_value: format!("proof-{domain}"),
                needs_validation: true,
            })
            .collect())
    }

    fn validate_challenge(
        &self,
        _order: &OrderHandle,
        _challenge: &IssuanceChallenge,
        _timeout: Duration,
        _shutdown: &ShutdownSignal,
    ) -> Result<(), IssuerError> {
        Ok(())
    }

    fn finalize(
        &self,
        _order: &OrderHandle,
        _private_key_pem: &str,
        _shutdown: &ShutdownSignal,
    ) -> Result<String, IssuerError> {
        let domains = self.domains.lock().unwrap().clone();
        Ok(issue_pem(&domains, self.expires_at).0)
    }

    fn abandon(&self, _order: &OrderHandle) {}
}

/// Full issuance pipeline over scripted collaborators.
pub fn acme_client(
    expires_at: DateTime<Utc>,
    dns: RecordingDns,
    shutdown: ShutdownSignal,
) -> AcmeIssuanceClient {
    AcmeIssuanceClient::new(
        Box::new(ScriptedAcme::new(expires_at)),
        Box::new(dns),
        Box::new(InstantPropagation),
        shutdown,
    )
}

/// Issuer that returns a fixed-expiry bundle, optionally pausing until the
/// test releases it or triggering shutdown once the bundle exists.
pub struct ControlledIssuer {
    pub expires_at: DateTime<Utc>,
    pub calls: Arc<Mutex<u32>>,
    pub entered: Option<Mutex<Sender<()>>>,
    pub release: Option<Mutex<Receiver<()>>>,
    pub shutdown_after_issue: Option<ShutdownSignal>,
}

impl ControlledIssuer {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            calls: Arc::new(Mutex::new(0)),
            entered: None,
            release: None,
            shutdown_after_issue: None,
        }
    }

    /// Returns the issuer plus (entered, release) handles for the test side.
    pub fn gated(expires_at: DateTime<Utc>) -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut issuer = Self::new(expires_at);
        issuer.entered = Some(Mutex::new(entered_tx));
        issuer.release = Some(Mutex::new(release_rx));
        (issuer, entered_rx, release_tx)
    }
}

impl CertificateIssuer for ControlledIssuer {
    fn request_certificate(
        &self,
        domains: &[String],
        _key_type: KeyType,
    ) -> Result<CertificateBundle, IssuanceError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(entered) = &self.entered {
            entered.lock().unwrap().send(()).ok();
        }
        if let Some(release) = &self.release {
            release.lock().unwrap().recv().ok();
        }
        let issued = bundle(domains, self.expires_at);
        if let Some(shutdown) = &self.shutdown_after_issue {
            shutdown.trigger();
        }
        Ok(issued)
    }
}
