use std::time::Duration;

use log::{debug, info, warn};

use crate::core::shutdown::ShutdownSignal;
use crate::core::types::{CertificateBundle, KeyType, Secret};
use crate::issuance::acme_workflow::generate_private_key;
use crate::issuance::dns::{PropagationChecker, PropagationState, record_name};
use crate::issuance::dns_providers::{ChallengeError, DnsChallengeAdapter};
use crate::issuance::issuer::{
    CertificateIssuer, IssuanceChallenge, IssuanceError, Issuer, OrderHandle,
};

const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Drives one DNS-01 issuance: present every proof, wait for it to be
/// visible, have the server validate it, finalize and clean up.
pub struct AcmeIssuanceClient {
    backend: Box<dyn Issuer>,
    dns: Box<dyn DnsChallengeAdapter>,
    propagation: Box<dyn PropagationChecker>,
    shutdown: ShutdownSignal,
    validation_timeout: Duration,
}

/// A proof published during the current attempt, to be removed afterwards.
struct Presented {
    domain: String,
    token: String,
}

impl AcmeIssuanceClient {
    pub fn new(
        backend: Box<dyn Issuer>,
        dns: Box<dyn DnsChallengeAdapter>,
        propagation: Box<dyn PropagationChecker>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            backend,
            dns,
            propagation,
            shutdown,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
        }
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    fn check_cancelled(&self) -> Result<(), IssuanceError> {
        if self.shutdown.is_triggered() {
            Err(IssuanceError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn dns_failure(&self, domain: &str, source: ChallengeError) -> IssuanceError {
        warn!(
            "[acme] {} {} the challenge for {}: {}",
            self.dns.provider(),
            failure_verb(&source),
            domain,
            source
        );
        IssuanceError::DnsChallenge {
            domain: domain.to_string(),
            source,
        }
    }

    fn present_all(
        &self,
        challenges: &[IssuanceChallenge],
        presented: &mut Vec<Presented>,
    ) -> Result<(), IssuanceError> {
        for challenge in challenges.iter().filter(|c| c.needs_validation) {
            self.check_cancelled()?;
            self.dns
                .present(&challenge.domain, &challenge.txt_value)
                .map_err(|err| self.dns_failure(&challenge.domain, err))?;
            presented.push(Presented {
                domain: challenge.domain.clone(),
                token: challenge.txt_value.clone(),
            });
        }
        Ok(())
    }

    fn await_propagation(&self, challenge: &IssuanceChallenge) -> Result<(), IssuanceError> {
        let name = record_name(&challenge.domain);
        let result = self
            .propagation
            .wait_for_record(&name, &challenge.txt_value, &self.shutdown)
            .map_err(|err| {
                warn!("[acme] propagation check for {} failed: {:#}", name, err);
                IssuanceError::ChallengeTimeout {
                    domain: challenge.domain.clone(),
                }
            })?;
        self.check_cancelled()?;
        if result.state == PropagationState::Found {
            debug!("[acme] {} is visible to public resolvers", name);
            return Ok(());
        }
        warn!(
            "[acme] {} not visible before timeout (state={:?}, observed={:?})",
            name, result.state, result.observed_values
        );
        Err(IssuanceError::ChallengeTimeout {
            domain: challenge.domain.clone(),
        })
    }

    fn drive(
        &self,
        order: &OrderHandle,
        domains: &[String],
        key_type: KeyType,
        presented: &mut Vec<Presented>,
    ) -> Result<CertificateBundle, IssuanceError> {
        let challenges = self
            .backend
            .get_challenges(order)
            .map_err(|e| IssuanceError::from_backend(e, IssuanceError::OrderRejected))?;
        let pending: Vec<&IssuanceChallenge> =
            challenges.iter().filter(|c| c.needs_validation).collect();
        info!(
            "[acme] order has {} authorization(s), {} need a DNS-01 challenge",
            challenges.len(),
            pending.len()
        );

        // Every record goes up before any wait so apex and wildcard values
        // sharing one name are published together.
        self.present_all(&challenges, presented)?;

        for challenge in &pending {
            self.await_propagation(challenge)?;
        }

        for challenge in &pending {
            self.check_cancelled()?;
            self.backend
                .validate_challenge(order, challenge, self.validation_timeout, &self.shutdown)
                .map_err(|e| IssuanceError::from_backend(e, IssuanceError::OrderRejected))?;
            info!("[acme] challenge for {} accepted", challenge.domain);
        }

        self.check_cancelled()?;
        let key_pem = Secret::new(
            generate_private_key(key_type)
                .map_err(|e| IssuanceError::SigningFailed(e.to_string()))?,
        );
        let chain_pem = self
            .backend
            .finalize(order, key_pem.expose(), &self.shutdown)
            .map_err(|e| IssuanceError::from_backend(e, IssuanceError::SigningFailed))?;

        let bundle = CertificateBundle::from_pem(&chain_pem, key_pem)
            .map_err(|e| IssuanceError::SigningFailed(e.to_string()))?;
        if !bundle.covers_exactly(domains) {
            return Err(IssuanceError::SigningFailed(format!(
                "issued certificate names {:?} differ from requested {:?}",
                bundle.domains, domains
            )));
        }
        Ok(bundle)
    }

    /// Removes every proof this attempt published. Failures are logged only.
    fn clean_up(&self, presented: &[Presented]) {
        for record in presented {
            match self.dns.clean_up(&record.domain, &record.token) {
                Ok(()) => debug!("[acme] cleaned up challenge for {}", record.domain),
                Err(err) => warn!(
                    "[acme] failed to clean up challenge for {} via {}: {}",
                    record.domain,
                    self.dns.provider(),
                    err
                ),
            }
        }
    }
}

impl CertificateIssuer for AcmeIssuanceClient {
    fn request_certificate(
        &self,
        domains: &[String],
        key_type: KeyType,
    ) -> Result<CertificateBundle, IssuanceError> {
        self.check_cancelled()?;
        self.backend
            .ensure_account()
            .map_err(|e| IssuanceError::from_backend(e, IssuanceError::RegistrationFailed))?;

        let order = self
            .backend
            .begin_order(domains)
            .map_err(|e| IssuanceError::from_backend(e, IssuanceError::OrderRejected))?;

        let mut presented = Vec::new();
        let result = self.drive(&order, domains, key_type, &mut presented);
        self.clean_up(&presented);

        match &result {
            Ok(bundle) => info!(
                "[acme] issued certificate for {:?}, expires {}",
                bundle.domains, bundle.expires_at
            ),
            Err(err) => {
                self.backend.abandon(&order);
                warn!("[acme] issuance for {:?} failed: {}", domains, err);
            }
        }
        result
    }
}

/// Log wording that separates transport failures from provider rejections.
fn failure_verb(err: &ChallengeError) -> &'static str {
    if err.is_unreachable() {
        "was unreachable while publishing"
    } else {
        "refused to publish"
    }
}
