use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::core::config::Configuration;
use crate::core::shutdown::ShutdownSignal;
use crate::core::types::{CertificateBundle, DueReason, RenewalDecision, StoredCertificateRef};
use crate::distribution::export::BundleExporter;
use crate::distribution::store::{CertificateStore, StoreError, find_by_name, reconcile};
use crate::domain::normalize_domain_for_display;
use crate::issuance::issuer::{CertificateIssuer, IssuanceError};

/// Where a renewal attempt currently is. Every exit returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CheckingDue,
    Issuing,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The store could not be read and nothing was cached.
    Lookup,
    Issuance,
    /// The issued certificate did not outlive the published one.
    Verification,
    Reconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another attempt was already running.
    Skipped,
    UpToDate(DueReason),
    Renewed(StoredCertificateRef),
    Failed(FailureStage),
    Cancelled,
}

/// Decides when the certificate needs (re)issuance, obtains it and publishes
/// it. The cached reference is written only here, and only after the store
/// accepted a newer certificate.
pub struct RenewalOrchestrator {
    config: Arc<Configuration>,
    issuer: Box<dyn CertificateIssuer>,
    store: Box<dyn CertificateStore>,
    exporter: Option<BundleExporter>,
    shutdown: ShutdownSignal,
    current: RwLock<Option<StoredCertificateRef>>,
    phase: Mutex<Phase>,
    in_flight: Mutex<()>,
}

impl RenewalOrchestrator {
    pub fn new(
        config: Arc<Configuration>,
        issuer: Box<dyn CertificateIssuer>,
        store: Box<dyn CertificateStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            issuer,
            store,
            exporter: None,
            shutdown,
            current: RwLock::new(None),
            phase: Mutex::new(Phase::Idle),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_exporter(mut self, exporter: BundleExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn current(&self) -> Option<StoredCertificateRef> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Looks the certificate up in the store and caches what was found.
    pub fn refresh_current(&self) -> Result<Option<StoredCertificateRef>, StoreError> {
        let found = find_by_name(self.store.as_ref(), &self.config.cert_display_name)?
            .map(|cert| cert.to_ref());
        self.replace_current(found.clone());
        Ok(found)
    }

    pub fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now())
    }

    /// One tick of the state machine, evaluated as if the time were `now`.
    pub fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("[renewal] attempt already in flight; skipping tick");
                return CycleOutcome::Skipped;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let outcome = self.attempt(now);
        self.set_phase(Phase::Idle);
        outcome
    }

    fn attempt(&self, now: DateTime<Utc>) -> CycleOutcome {
        let name = self.config.cert_display_name.as_str();
        let display = normalize_domain_for_display(self.config.primary_domain());

        self.set_phase(Phase::CheckingDue);
        let current = match find_by_name(self.store.as_ref(), name) {
            Ok(found) => found.map(|cert| cert.to_ref()),
            Err(err) => match self.current() {
                Some(cached) => {
                    warn!("[renewal] store lookup for '{name}' failed ({err}); using cached state");
                    Some(cached)
                }
                None => {
                    error!("[renewal] store lookup for '{name}' failed: {err}");
                    return CycleOutcome::Failed(FailureStage::Lookup);
                }
            },
        };

        let decision = RenewalDecision::evaluate(
            current.as_ref(),
            now,
            self.config.renewal_window,
            self.config.api_environment,
        );
        if !decision.due {
            info!("[renewal] certificate for {display} is not due ({:?})", decision.reason);
            return CycleOutcome::UpToDate(decision.reason);
        }
        info!("[renewal] certificate for {display} is due ({:?})", decision.reason);

        if self.shutdown.is_triggered() {
            return CycleOutcome::Cancelled;
        }
        self.set_phase(Phase::Issuing);
        let bundle = match self
            .issuer
            .request_certificate(&self.config.domains, self.config.key_type)
        {
            Ok(bundle) => bundle,
            Err(IssuanceError::Cancelled) => {
                info!("[renewal] issuance for {display} cancelled by shutdown");
                return CycleOutcome::Cancelled;
            }
            Err(err) => {
                error!("[renewal] issuance for {display} failed: {err}");
                return CycleOutcome::Failed(FailureStage::Issuance);
            }
        };

        if let Some(expiry) = current.as_ref().and_then(|c| c.current_expiry)
            && bundle.expires_at <= expiry
        {
            warn!(
                "[renewal] new certificate for {display} expires {} which is not after {expiry}; discarding it",
                bundle.expires_at
            );
            return CycleOutcome::Failed(FailureStage::Verification);
        }

        if self.shutdown.is_triggered() {
            info!("[renewal] shutdown before publishing; discarding certificate for {display}");
            return CycleOutcome::Cancelled;
        }
        self.set_phase(Phase::Reconciling);
        match reconcile(self.store.as_ref(), name, &bundle) {
            Ok(stored) => {
                self.replace_current(Some(stored.clone()));
                self.export(&bundle);
                info!(
                    "[renewal] published '{}' for {display}, valid until {}",
                    stored.name, bundle.expires_at
                );
                CycleOutcome::Renewed(stored)
            }
            Err(err) => {
                error!("[renewal] publishing '{name}' failed: {err}");
                CycleOutcome::Failed(FailureStage::Reconciliation)
            }
        }
    }

    fn export(&self, bundle: &CertificateBundle) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        if let Err(err) = exporter.export(self.config.primary_domain(), bundle) {
            warn!("[renewal] exporting certificate files failed: {err:#}");
        }
    }

    fn replace_current(&self, next: Option<StoredCertificateRef>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = next;
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Configuration;
    use crate::core::types::{KeyType, Secret};
    use crate::core::types::tests::self_signed;
    use crate::distribution::store::{CertificatePayload, StoredCertificate};
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> Arc<Configuration> {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CATTLE_URL", "http://rancher:8080/v2-beta"),
            ("CATTLE_ACCESS_KEY", "access"),
            ("CATTLE_SECRET_KEY", "secret"),
            ("EULA", "Yes"),
            ("API_VERSION", "Sandbox"),
            ("EMAIL", "ops@example.com"),
            ("DOMAINS", "example.com"),
            ("PUBLIC_KEY_TYPE", "RSA-2048"),
            ("RENEWAL_TIME", "3"),
            ("PROVIDER", "DigitalOcean"),
            ("DO_ACCESS_TOKEN", "token"),
        ]);
        Arc::new(
            Configuration::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
                .expect("config"),
        )
    }

    struct StaticIssuer {
        expiry: DateTime<Utc>,
        calls: AtomicUsize,
    }

    impl CertificateIssuer for StaticIssuer {
        fn request_certificate(
            &self,
            domains: &[String],
            _key_type: KeyType,
        ) -> Result<CertificateBundle, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let names: Vec<&str> = domains.iter().map(String::as_str).collect();
            let (cert, key) = self_signed(&names, self.expiry);
            Ok(CertificateBundle::from_pem(&cert, Secret::new(key)).expect("bundle"))
        }
    }

    struct UnreachableStore;

    impl CertificateStore for UnreachableStore {
        fn list_certificates(&self, _: &str) -> Result<Vec<StoredCertificate>, StoreError> {
            Err(StoreError::StoreUnreachable("connection failed".into()))
        }
        fn create_certificate(
            &self,
            _: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            Err(StoreError::StoreUnreachable("connection failed".into()))
        }
        fn update_certificate(
            &self,
            _: &str,
            _: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            Err(StoreError::StoreUnreachable("connection failed".into()))
        }
    }

    #[test]
    fn lookup_failure_without_cache_does_not_issue() {
        let issuer = Arc::new(StaticIssuer {
            expiry: Utc::now() + Duration::days(90),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = RenewalOrchestrator::new(
            config(),
            Box::new(ForwardIssuer(issuer.clone())),
            Box::new(UnreachableStore),
            ShutdownSignal::new(),
        );
        assert_eq!(
            orchestrator.run_cycle(),
            CycleOutcome::Failed(FailureStage::Lookup)
        );
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert!(orchestrator.current().is_none());
    }

    #[test]
    fn shutdown_before_issuing_cancels() {
        let issuer = Arc::new(StaticIssuer {
            expiry: Utc::now() + Duration::days(90),
            calls: AtomicUsize::new(0),
        });
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let orchestrator = RenewalOrchestrator::new(
            config(),
            Box::new(ForwardIssuer(issuer.clone())),
            Box::new(EmptyStore),
            shutdown,
        );
        assert_eq!(orchestrator.run_cycle(), CycleOutcome::Cancelled);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    struct ForwardIssuer(Arc<StaticIssuer>);

    impl CertificateIssuer for ForwardIssuer {
        fn request_certificate(
            &self,
            domains: &[String],
            key_type: KeyType,
        ) -> Result<CertificateBundle, IssuanceError> {
            self.0.request_certificate(domains, key_type)
        }
    }

    struct EmptyStore;

    impl CertificateStore for EmptyStore {
        fn list_certificates(&self, _: &str) -> Result<Vec<StoredCertificate>, StoreError> {
            Ok(Vec::new())
        }
        fn create_certificate(
            &self,
            payload: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            Ok(StoredCertificate {
                id: "1c1".into(),
                name: payload.name.to_string(),
                expires_at: None,
                issuer: None,
            })
        }
        fn update_certificate(
            &self,
            id: &str,
            payload: &CertificatePayload<'_>,
        ) -> Result<StoredCertificate, StoreError> {
            Ok(StoredCertificate {
                id: id.to_string(),
                name: payload.name.to_string(),
                expires_at: None,
                issuer: None,
            })
        }
    }

    #[test]
    fn creates_when_store_is_empty() {
        let issuer = Arc::new(StaticIssuer {
            expiry: Utc::now() + Duration::days(90),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = RenewalOrchestrator::new(
            config(),
            Box::new(ForwardIssuer(issuer)),
            Box::new(EmptyStore),
            ShutdownSignal::new(),
        );
        match orchestrator.run_cycle() {
            CycleOutcome::Renewed(stored) => {
                assert_eq!(stored.id, "1c1");
                assert_eq!(stored.name, "[LE-TESTING] example.com");
                assert_eq!(orchestrator.current(), Some(stored));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
