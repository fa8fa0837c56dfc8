use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pem::{EncodeConfig, LineEnding};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use zeroize::Zeroizing;

pub const ISSUER_PRODUCTION: &str = "Let's Encrypt";
pub const ISSUER_STAGING: &str = "(STAGING)";
const ISSUER_STAGING_LEGACY: &str = "Fake LE";

/// Which ACME directory certificates are requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiEnvironment {
    Production,
    Staging,
}

impl ApiEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiEnvironment::Production => "production",
            ApiEnvironment::Staging => "staging",
        }
    }

    /// Prefix of the auto-derived certificate name in the store.
    pub fn display_prefix(&self) -> &'static str {
        match self {
            ApiEnvironment::Production => "[LE] ",
            ApiEnvironment::Staging => "[LE-TESTING] ",
        }
    }

    pub fn directory_url(&self) -> &'static str {
        match self {
            ApiEnvironment::Production => "https://acme-v02.api.letsencrypt.org/directory",
            ApiEnvironment::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
        }
    }

    /// Whether a certificate issuer DN belongs to this environment's CA.
    pub fn matches_issuer(&self, issuer: &str) -> bool {
        let staging = issuer.contains(ISSUER_STAGING) || issuer.contains(ISSUER_STAGING_LEGACY);
        match self {
            ApiEnvironment::Production => !staging && issuer.contains(ISSUER_PRODUCTION),
            ApiEnvironment::Staging => staging,
        }
    }
}

impl FromStr for ApiEnvironment {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "Production" => Ok(ApiEnvironment::Production),
            "Sandbox" | "Staging" => Ok(ApiEnvironment::Staging),
            other => Err(format!(
                "unknown API environment '{other}' (expected Production or Sandbox)"
            )),
        }
    }
}

/// Key algorithm of the issued certificate's private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyType {
    Rsa2048,
    Rsa4096,
    Rsa8192,
    EcdsaP256,
    EcdsaP384,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Rsa2048 => "RSA-2048",
            KeyType::Rsa4096 => "RSA-4096",
            KeyType::Rsa8192 => "RSA-8192",
            KeyType::EcdsaP256 => "ECDSA-256",
            KeyType::EcdsaP384 => "ECDSA-384",
        }
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RSA-2048" | "RSA2048" => Ok(KeyType::Rsa2048),
            "RSA-4096" | "RSA4096" => Ok(KeyType::Rsa4096),
            "RSA-8192" | "RSA8192" => Ok(KeyType::Rsa8192),
            "ECDSA-256" | "EC256" | "P256" => Ok(KeyType::EcdsaP256),
            "ECDSA-384" | "EC384" | "P384" => Ok(KeyType::EcdsaP384),
            _ => Err(format!(
                "unknown key type '{}' (expected RSA-2048, RSA-4096, RSA-8192, ECDSA-256 or ECDSA-384)",
                raw.trim()
            )),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential or key material. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("certificate PEM is empty")]
    Empty,
    #[error("failed to parse certificate PEM: {0}")]
    Parse(String),
    #[error("certificate validity timestamp out of range")]
    Validity,
}

/// A freshly issued certificate with its key. Produced only by a successful
/// issuance and consumed by reconciliation.
pub struct CertificateBundle {
    pub certificate_pem: String,
    pub chain_pem: String,
    private_key_pem: Secret,
    pub domains: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub fingerprint: String,
}

impl CertificateBundle {
    /// Builds a bundle from a full-chain PEM (leaf first) and its private key.
    /// `domains` is taken from the leaf's subject alternative names.
    pub fn from_pem(fullchain_pem: &str, private_key_pem: Secret) -> Result<Self, BundleError> {
        let blocks = pem::parse_many(fullchain_pem)
            .map_err(|err| BundleError::Parse(err.to_string()))?;
        let encoded: Vec<String> = blocks
            .iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| {
                pem::encode_config(block, EncodeConfig::new().set_line_ending(LineEnding::LF))
            })
            .collect();
        let leaf_pem = encoded.first().cloned().ok_or(BundleError::Empty)?;
        let chain_pem = encoded[1..].join("");

        let info = inspect_certificate(&leaf_pem)?;
        Ok(Self {
            certificate_pem: leaf_pem,
            chain_pem,
            private_key_pem,
            domains: info.domains,
            expires_at: info.not_after,
            issuer: info.issuer,
            fingerprint: info.fingerprint,
        })
    }

    pub fn private_key_pem(&self) -> &str {
        self.private_key_pem.expose()
    }

    pub fn fullchain_pem(&self) -> String {
        format!("{}{}", self.certificate_pem, self.chain_pem)
    }

    /// True when the SAN set equals `requested`, ignoring order and case.
    pub fn covers_exactly(&self, requested: &[String]) -> bool {
        let mut ours: Vec<String> = self.domains.iter().map(|d| d.to_lowercase()).collect();
        let mut theirs: Vec<String> = requested.iter().map(|d| d.to_lowercase()).collect();
        ours.sort();
        ours.dedup();
        theirs.sort();
        theirs.dedup();
        ours == theirs
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("domains", &self.domains)
            .field("expires_at", &self.expires_at)
            .field("issuer", &self.issuer)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Details read from a single PEM certificate.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub domains: Vec<String>,
    pub not_after: DateTime<Utc>,
    pub issuer: String,
    pub fingerprint: String,
}

pub fn inspect_certificate(pem_text: &str) -> Result<CertificateInfo, BundleError> {
    let (_, pem_block) =
        parse_x509_pem(pem_text.as_bytes()).map_err(|e| BundleError::Parse(e.to_string()))?;
    let cert = pem_block
        .parse_x509()
        .map_err(|e| BundleError::Parse(e.to_string()))?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or(BundleError::Validity)?;

    let mut domains = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                domains.push(dns.to_string());
            }
        }
    }
    if domains.is_empty() {
        if let Some(cn) = cert.subject().iter_common_name().next() {
            if let Ok(cn) = cn.as_str() {
                domains.push(cn.to_string());
            }
        }
    }

    let fingerprint = {
        let mut hasher = Sha256::new();
        hasher.update(cert.as_raw());
        hex::encode(hasher.finalize())
    };

    Ok(CertificateInfo {
        domains,
        not_after,
        issuer: cert.issuer().to_string(),
        fingerprint,
    })
}

/// The orchestrator's last known view of the published certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificateRef {
    pub id: String,
    pub name: String,
    pub current_expiry: Option<DateTime<Utc>>,
    /// Issuer DN read from the certificate itself; `None` when only store
    /// metadata was available.
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DueReason {
    NoCertificate,
    UnknownExpiry,
    IssuerMismatch,
    WithinWindow { days_left: i64 },
    NotDue { days_left: i64 },
}

/// Whether a renewal should run now. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalDecision {
    pub due: bool,
    pub reason: DueReason,
}

impl RenewalDecision {
    pub fn evaluate(
        current: Option<&StoredCertificateRef>,
        now: DateTime<Utc>,
        window: Duration,
        environment: ApiEnvironment,
    ) -> Self {
        let Some(current) = current else {
            return Self::due(DueReason::NoCertificate);
        };
        if let Some(issuer) = &current.issuer
            && !environment.matches_issuer(issuer)
        {
            return Self::due(DueReason::IssuerMismatch);
        }
        let Some(expiry) = current.current_expiry else {
            return Self::due(DueReason::UnknownExpiry);
        };
        let days_left = (expiry - now).num_days();
        if now >= expiry - window {
            Self::due(DueReason::WithinWindow { days_left })
        } else {
            Self {
                due: false,
                reason: DueReason::NotDue { days_left },
            }
        }
    }

    fn due(reason: DueReason) -> Self {
        Self { due: true, reason }
    }
}
