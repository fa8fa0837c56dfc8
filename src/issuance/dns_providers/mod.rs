use log::debug;
use thiserror::Error;

use crate::core::config::{CloudflareAuth, DnsProviderConfig};
use crate::domain::normalize_domain;

mod base;
mod cloudflare;
mod digitalocean;
mod dnsimple;
mod dyn_dns;
pub(crate) mod http;
mod retry;
mod route53;

pub use base::{AtomicDnsOperations, DnsRecord, TxtRecordAdapter};
pub use retry::{poll_dns_propagation, retry_provider_verification};

pub use cloudflare::CloudflareOperations;
pub use digitalocean::DigitalOceanOperations;
pub use dnsimple::DnsSimpleOperations;
pub use dyn_dns::DynOperations;
pub use route53::Route53Adapter;

/// Publishes and removes DNS-01 proofs for one provider.
pub trait DnsChallengeAdapter: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Makes `token` visible at `_acme-challenge.<domain>`. Calling it twice
    /// with the same token leaves a single record.
    fn present(&self, domain: &str, token: &str) -> Result<(), ChallengeError>;

    /// Removes the record carrying `token`. Records with other values are left
    /// alone and an already absent record is not an error.
    fn clean_up(&self, domain: &str, token: &str) -> Result<(), ChallengeError>;
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("{provider} is unreachable: {message}")]
    Unreachable {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} has no zone hosting {domain}")]
    ZoneNotFound {
        provider: &'static str,
        domain: String,
    },
    #[error("{provider} rejected the request: {message}")]
    Rejected {
        provider: &'static str,
        message: String,
    },
}

impl ChallengeError {
    /// Sorts a provider-level failure into the typed taxonomy. Transport
    /// failures anywhere in the chain count as unreachable.
    pub fn classify(provider: &'static str, err: anyhow::Error) -> Self {
        if let Some(missing) = err.downcast_ref::<ZoneNotFound>() {
            return ChallengeError::ZoneNotFound {
                provider,
                domain: missing.0.clone(),
            };
        }
        let transport = err.chain().any(|cause| {
            cause
                .downcast_ref::<reqwest::Error>()
                .map(|e| e.is_timeout() || e.is_connect())
                .unwrap_or(false)
                || cause.is::<ProviderUnreachable>()
        });
        let message = format!("{err:#}");
        if transport {
            ChallengeError::Unreachable { provider, message }
        } else {
            ChallengeError::Rejected { provider, message }
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ChallengeError::Unreachable { .. })
    }
}

/// Raised by zone discovery when no hosted zone is a suffix of the record.
#[derive(Debug, Error)]
#[error("no hosted zone found for {0}")]
pub(crate) struct ZoneNotFound(pub String);

/// Marks transport failures from clients that are not reqwest based.
#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct ProviderUnreachable(pub String);

pub(crate) fn matches_zone(domain_suffix: &str, zone_name: &str) -> bool {
    let domain_suffix = match normalize_domain(domain_suffix) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let zone_name = match normalize_domain(zone_name) {
        Ok(value) => value,
        Err(_) => return false,
    };
    zone_name == domain_suffix || domain_suffix.ends_with(&format!(".{}", zone_name))
}

/// Picks the most specific zone (longest name) that hosts `record_name`.
pub(crate) fn best_zone<'a, T>(
    record_name: &str,
    zones: &'a [T],
    zone_name: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    let found = zones
        .iter()
        .filter(|zone| matches_zone(record_name, zone_name(zone)))
        .max_by_key(|zone| zone_name(zone).trim_end_matches('.').len());
    if let Some(zone) = found {
        debug!("[dns] {} resolved to zone {}", record_name, zone_name(zone));
    }
    found
}

/// Builds the adapter for the configured provider.
pub fn adapter_for_provider(provider: &DnsProviderConfig) -> Box<dyn DnsChallengeAdapter> {
    match provider {
        DnsProviderConfig::Cloudflare(auth) => {
            let ops = match auth {
                CloudflareAuth::ApiToken(token) => {
                    CloudflareOperations::with_token(token.expose().to_string())
                }
                CloudflareAuth::GlobalKey { email, key } => {
                    CloudflareOperations::with_global_key(email.clone(), key.expose().to_string())
                }
            };
            Box::new(TxtRecordAdapter::new("cloudflare", ops))
        }
        DnsProviderConfig::Route53 {
            access_key,
            secret_key,
            region,
        } => Box::new(Route53Adapter::new(
            access_key.clone(),
            secret_key.expose().to_string(),
            region.clone(),
        )),
        DnsProviderConfig::DigitalOcean { api_token } => Box::new(TxtRecordAdapter::new(
            "digitalocean",
            DigitalOceanOperations::new(api_token.expose().to_string()),
        )),
        DnsProviderConfig::DnsSimple {
            api_token,
            account_id,
        } => Box::new(TxtRecordAdapter::new(
            "dnsimple",
            DnsSimpleOperations::new(api_token.expose().to_string(), account_id.clone()),
        )),
        DnsProviderConfig::Dyn {
            customer_name,
            user_name,
            password,
        } => Box::new(TxtRecordAdapter::new(
            "dyn",
            DynOperations::new(
                customer_name.clone(),
                user_name.clone(),
                password.expose().to_string(),
            ),
        )),
    }
}

/// Strips the zone suffix from a fully qualified record name. Providers that
/// address records relative to their zone use this.
pub(crate) fn relative_name(record_name: &str, zone: &str) -> String {
    let record_name = record_name.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if record_name.eq_ignore_ascii_case(zone) {
        return String::new();
    }
    record_name
        .strip_suffix(&format!(".{zone}"))
        .unwrap_or(record_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Secret;

    #[test]
    fn matches_exact_zone_name() {
        assert!(matches_zone("example.com", "example.com"));
        assert!(!matches_zone("example.com", "other.com"));
    }

    #[test]
    fn matches_subdomain_suffix() {
        assert!(matches_zone("sub.example.com", "example.com"));
        assert!(!matches_zone("example.com", "sub.example.com"));
        assert!(!matches_zone("badexample.com", "example.com"));
    }

    #[test]
    fn matches_idn_suffix() {
        assert!(matches_zone("testé.ezs3.net", "ezs3.net"));
        assert!(matches_zone("xn--test-epa.ezs3.net", "ezs3.net"));
        assert!(matches_zone("testé.fr", "xn--test-epa.fr"));
        assert!(!matches_zone("example.com", "xn--test-epa.fr"));
    }

    #[test]
    fn best_zone_prefers_most_specific() {
        let zones = vec!["example.com.".to_string(), "dev.example.com.".to_string()];
        let picked = best_zone("_acme-challenge.api.dev.example.com", &zones, |z| z.as_str());
        assert_eq!(picked.map(String::as_str), Some("dev.example.com."));
        assert!(best_zone("_acme-challenge.other.org", &zones, |z| z.as_str()).is_none());
    }

    #[test]
    fn relative_name_strips_zone() {
        assert_eq!(
            relative_name("_acme-challenge.www.example.com", "example.com"),
            "_acme-challenge.www"
        );
        assert_eq!(relative_name("example.com.", "example.com"), "");
    }

    #[test]
    fn classify_maps_zone_lookup_failures() {
        let err = ChallengeError::classify(
            "cloudflare",
            anyhow::Error::new(ZoneNotFound("_acme-challenge.example.org".into())),
        );
        assert!(matches!(err, ChallengeError::ZoneNotFound { .. }));
        let err = ChallengeError::classify("cloudflare", anyhow::anyhow!("bad request"));
        assert!(matches!(err, ChallengeError::Rejected { .. }));
        assert!(!err.is_unreachable());
        let err = ChallengeError::classify(
            "route53",
            anyhow::Error::new(ProviderUnreachable("dispatch failure".into())),
        );
        assert!(err.is_unreachable());
    }

    #[test]
    fn adapter_names_follow_provider() {
        let adapter = adapter_for_provider(&DnsProviderConfig::DigitalOcean {
            api_token: Secret::new("token"),
        });
        assert_eq!(adapter.provider(), "digitalocean");
        let adapter = adapter_for_provider(&DnsProviderConfig::Cloudflare(
            CloudflareAuth::ApiToken(Secret::new("token")),
        ));
        assert_eq!(adapter.provider(), "cloudflare");
    }
}
