use std::time::Duration;

use thiserror::Error;

use crate::core::shutdown::ShutdownSignal;
use crate::core::types::{CertificateBundle, KeyType};
use crate::issuance::dns_providers::ChallengeError;

/// Obtains a signed certificate for a set of names.
pub trait CertificateIssuer: Send + Sync {
    fn request_certificate(
        &self,
        domains: &[String],
        key_type: KeyType,
    ) -> Result<CertificateBundle, IssuanceError>;
}

/// ACME protocol operations, one order at a time.
pub trait Issuer: Send + Sync {
    fn ensure_account(&self) -> Result<(), IssuerError>;
    fn begin_order(&self, domains: &[String]) -> Result<OrderHandle, IssuerError>;
    fn get_challenges(&self, order: &OrderHandle) -> Result<Vec<IssuanceChallenge>, IssuerError>;
    /// Asks the server to check the proof and waits for the verdict, at most
    /// `timeout`.
    fn validate_challenge(
        &self,
        order: &OrderHandle,
        challenge: &IssuanceChallenge,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<(), IssuerError>;
    /// Submits the CSR for `private_key_pem` and returns the full chain PEM.
    fn finalize(
        &self,
        order: &OrderHandle,
        private_key_pem: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<String, IssuerError>;
    /// Forgets an order that will not be finalized.
    fn abandon(&self, order: &OrderHandle);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceChallenge {
    /// Backend-specific key of the authorization within its order.
    pub id: String,
    pub domain: String,
    pub txt_value: String,
    /// False when the server already holds a valid authorization.
    pub needs_validation: bool,
}

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
    #[error("account registration failed: {0}")]
    Registration(String),
    #[error("order rejected: {0}")]
    Order(String),
    #[error("challenge for {domain} invalid: {reason}")]
    ChallengeInvalid { domain: String, reason: String },
    #[error("challenge for {domain} still pending after {waited:?}")]
    ChallengeTimeout { domain: String, waited: Duration },
    #[error("finalization failed: {0}")]
    Finalize(String),
    #[error("order {0} is not pending")]
    UnknownOrder(String),
    #[error("cancelled")]
    Cancelled,
}

/// Why an issuance attempt produced no certificate. No variant carries key
/// material.
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("ACME account registration failed: {0}")]
    RegistrationFailed(String),
    #[error("ACME server rejected the order: {0}")]
    OrderRejected(String),
    #[error("challenge for {domain} was rejected: {reason}")]
    ChallengeRejected { domain: String, reason: String },
    #[error("challenge for {domain} timed out")]
    ChallengeTimeout { domain: String },
    #[error("certificate signing failed: {0}")]
    SigningFailed(String),
    #[error("ACME server unreachable: {0}")]
    ProviderUnreachable(String),
    #[error("DNS challenge for {domain} failed")]
    DnsChallenge {
        domain: String,
        #[source]
        source: ChallengeError,
    },
    #[error("issuance cancelled by shutdown")]
    Cancelled,
}

impl IssuanceError {
    /// Maps a backend failure, `fallback` deciding what a generic rejection means
    /// at the current step.
    pub(crate) fn from_backend(err: IssuerError, fallback: fn(String) -> IssuanceError) -> Self {
        match err {
            IssuerError::Unavailable(message) => IssuanceError::ProviderUnreachable(message),
            IssuerError::Registration(message) => IssuanceError::RegistrationFailed(message),
            IssuerError::Order(message) => IssuanceError::OrderRejected(message),
            IssuerError::ChallengeInvalid { domain, reason } => {
                IssuanceError::ChallengeRejected { domain, reason }
            }
            IssuerError::ChallengeTimeout { domain, .. } => IssuanceError::ChallengeTimeout { domain },
            IssuerError::Finalize(message) => IssuanceError::SigningFailed(message),
            IssuerError::Cancelled => IssuanceError::Cancelled,
            other @ IssuerError::UnknownOrder(_) => fallback(other.to_string()),
        }
    }
}
