//! Startup configuration.
//!
//! Every setting is read from the process environment once, validated, and
//! frozen into a [`Configuration`]. Validation never stops at the first bad
//! value: all problems are collected so an operator can fix them in one pass.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::{ApiEnvironment, KeyType, Secret};
use crate::domain::normalize_domain;

const DEFAULT_STATE_DIR: &str = "/etc/letsencrypt";
const DEFAULT_RENEWAL_WINDOW_DAYS: i64 = 20;
const DEFAULT_PROPAGATION_TIMEOUT_SECS: u64 = 120;
const EULA_ACCEPTED: &str = "Yes";

/// A single reason the environment could not be turned into a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigProblem {
    #[error("required environment variable not set: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("terms of service were not accepted (EULA must be set to \"Yes\")")]
    TermsNotAccepted,
}

/// Every problem found while loading the configuration.
#[derive(Debug)]
pub struct ConfigError {
    pub problems: Vec<ConfigProblem>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration ({} problem(s))", self.problems.len())?;
        for problem in &self.problems {
            write!(f, "\n  - {problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub access_key: String,
    pub secret_key: Secret,
}

#[derive(Debug, Clone)]
pub enum CloudflareAuth {
    ApiToken(Secret),
    GlobalKey { email: String, key: Secret },
}

/// DNS provider selection together with the credentials it needs.
#[derive(Debug, Clone)]
pub enum DnsProviderConfig {
    Cloudflare(CloudflareAuth),
    Route53 {
        access_key: String,
        secret_key: Secret,
        region: Option<String>,
    },
    DigitalOcean {
        api_token: Secret,
    },
    DnsSimple {
        api_token: Secret,
        account_id: Option<String>,
    },
    Dyn {
        customer_name: String,
        user_name: String,
        password: Secret,
    },
}

impl DnsProviderConfig {
    pub fn name(&self) -> &'static str {
        match self {
            DnsProviderConfig::Cloudflare(_) => "cloudflare",
            DnsProviderConfig::Route53 { .. } => "route53",
            DnsProviderConfig::DigitalOcean { .. } => "digitalocean",
            DnsProviderConfig::DnsSimple { .. } => "dnsimple",
            DnsProviderConfig::Dyn { .. } => "dyn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Cloudflare,
    Route53,
    DigitalOcean,
    DnsSimple,
    Dyn,
}

impl ProviderKind {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Ok(ProviderKind::Cloudflare),
            "route53" | "aws" => Ok(ProviderKind::Route53),
            "digitalocean" | "do" => Ok(ProviderKind::DigitalOcean),
            "dnsimple" => Ok(ProviderKind::DnsSimple),
            "dyn" => Ok(ProviderKind::Dyn),
            _ => Err(format!(
                "unknown provider '{}' (expected CloudFlare, Route53, DigitalOcean, DNSimple or Dyn)",
                raw.trim()
            )),
        }
    }
}

/// Validated, immutable process settings.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub domains: Vec<String>,
    pub renewal_hour: u32,
    pub account_email: String,
    pub key_type: KeyType,
    pub api_environment: ApiEnvironment,
    pub dns_provider: DnsProviderConfig,
    pub cert_display_name: String,
    pub debug: bool,
    pub store: StoreSettings,
    pub renewal_window: chrono::Duration,
    pub check_interval: Option<Duration>,
    pub propagation_timeout: Duration,
    pub state_dir: PathBuf,
    pub export_dir: Option<PathBuf>,
}

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvReader::new(lookup);

        let store_url = env.required("CATTLE_URL");
        let store_access_key = env.required("CATTLE_ACCESS_KEY");
        let store_secret_key = env.required("CATTLE_SECRET_KEY");

        if env.optional("EULA").as_deref() != Some(EULA_ACCEPTED) {
            env.problems.push(ConfigProblem::TermsNotAccepted);
        }

        let debug = match env.optional("DEBUG") {
            Some(raw) => env.parse("DEBUG", &raw, parse_bool).unwrap_or(false),
            None => false,
        };

        let api_environment = env
            .required("API_VERSION")
            .and_then(|raw| env.parse("API_VERSION", &raw, |v| v.parse::<ApiEnvironment>()));
        let account_email = env
            .required("EMAIL")
            .and_then(|raw| env.parse("EMAIL", &raw, parse_email));
        let domains = env
            .required("DOMAINS")
            .and_then(|raw| env.parse("DOMAINS", &raw, parse_domains));
        let key_type = env
            .required("PUBLIC_KEY_TYPE")
            .and_then(|raw| env.parse("PUBLIC_KEY_TYPE", &raw, |v| v.parse::<KeyType>()));
        let renewal_hour = env
            .required("RENEWAL_TIME")
            .and_then(|raw| env.parse("RENEWAL_TIME", &raw, parse_renewal_hour));
        let store_url = store_url.and_then(|raw| env.parse("CATTLE_URL", &raw, parse_url));

        let dns_provider = env
            .required("PROVIDER")
            .and_then(|raw| env.parse("PROVIDER", &raw, ProviderKind::parse))
            .and_then(|kind| env.provider_credentials(kind));

        let renewal_window = match env.optional("RENEWAL_WINDOW_DAYS") {
            Some(raw) => env.parse("RENEWAL_WINDOW_DAYS", &raw, |v| parse_ranged(v, 1, 89)),
            None => Some(DEFAULT_RENEWAL_WINDOW_DAYS),
        }
        .map(chrono::Duration::days);
        let check_interval = env
            .optional("CHECK_INTERVAL_MINUTES")
            .and_then(|raw| env.parse("CHECK_INTERVAL_MINUTES", &raw, |v| parse_ranged(v, 1, 10_080)))
            .map(|minutes| Duration::from_secs(minutes as u64 * 60));
        let propagation_timeout = match env.optional("DNS_PROPAGATION_TIMEOUT_SECS") {
            Some(raw) => env.parse("DNS_PROPAGATION_TIMEOUT_SECS", &raw, |v| {
                parse_ranged(v, 10, 1800)
            }),
            None => Some(DEFAULT_PROPAGATION_TIMEOUT_SECS as i64),
        }
        .map(|secs| Duration::from_secs(secs as u64));

        let state_dir = PathBuf::from(
            env.optional("STATE_DIR")
                .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()),
        );
        let export_dir = env.optional("CERT_EXPORT_DIR").map(PathBuf::from);
        let explicit_name = env.optional("CERT_NAME");

        let (
            Some(store_url),
            Some(store_access_key),
            Some(store_secret_key),
            Some(api_environment),
            Some(account_email),
            Some(domains),
            Some(key_type),
            Some(renewal_hour),
            Some(dns_provider),
            Some(renewal_window),
            Some(propagation_timeout),
        ) = (
            store_url,
            store_access_key,
            store_secret_key,
            api_environment,
            account_email,
            domains,
            key_type,
            renewal_hour,
            dns_provider,
            renewal_window,
            propagation_timeout,
        )
        else {
            return Err(ConfigError {
                problems: env.problems,
            });
        };

        if !env.problems.is_empty() {
            return Err(ConfigError {
                problems: env.problems,
            });
        }

        let cert_display_name = explicit_name.unwrap_or_else(|| {
            format!("{}{}", api_environment.display_prefix(), domains[0])
        });

        Ok(Configuration {
            domains,
            renewal_hour,
            account_email,
            key_type,
            api_environment,
            dns_provider,
            cert_display_name,
            debug,
            store: StoreSettings {
                url: store_url,
                access_key: store_access_key,
                secret_key: Secret::new(store_secret_key),
            },
            renewal_window,
            check_interval,
            propagation_timeout,
            state_dir,
            export_dir,
        })
    }

    pub fn primary_domain(&self) -> &str {
        &self.domains[0]
    }
}

struct EnvReader<F> {
    lookup: F,
    problems: Vec<ConfigProblem>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            problems: Vec::new(),
        }
    }

    /// Trimmed value, or `None` when unset or blank.
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&mut self, name: &'static str) -> Option<String> {
        let value = self.optional(name);
        if value.is_none() {
            self.problems.push(ConfigProblem::Missing(name));
        }
        value
    }

    fn parse<T>(
        &mut self,
        name: &'static str,
        raw: &str,
        parser: impl FnOnce(&str) -> Result<T, String>,
    ) -> Option<T> {
        match parser(raw) {
            Ok(value) => Some(value),
            Err(reason) => {
                self.problems.push(ConfigProblem::Invalid { name, reason });
                None
            }
        }
    }

    fn provider_credentials(&mut self, kind: ProviderKind) -> Option<DnsProviderConfig> {
        match kind {
            ProviderKind::Cloudflare => {
                if let Some(token) = self.optional("CLOUDFLARE_API_TOKEN") {
                    return Some(DnsProviderConfig::Cloudflare(CloudflareAuth::ApiToken(
                        Secret::new(token),
                    )));
                }
                let email = self.required("CLOUDFLARE_EMAIL");
                let key = self.required("CLOUDFLARE_KEY");
                Some(DnsProviderConfig::Cloudflare(CloudflareAuth::GlobalKey {
                    email: email?,
                    key: Secret::new(key?),
                }))
            }
            ProviderKind::Route53 => {
                let access_key = self.required("AWS_ACCESS_KEY");
                let secret_key = self.required("AWS_SECRET_KEY");
                Some(DnsProviderConfig::Route53 {
                    access_key: access_key?,
                    secret_key: Secret::new(secret_key?),
                    region: self.optional("AWS_REGION"),
                })
            }
            ProviderKind::DigitalOcean => {
                let token = self.required("DO_ACCESS_TOKEN")?;
                Some(DnsProviderConfig::DigitalOcean {
                    api_token: Secret::new(token),
                })
            }
            ProviderKind::DnsSimple => {
                let token = self.required("DNSIMPLE_KEY")?;
                Some(DnsProviderConfig::DnsSimple {
                    api_token: Secret::new(token),
                    account_id: self.optional("DNSIMPLE_ACCOUNT_ID"),
                })
            }
            ProviderKind::Dyn => {
                let customer_name = self.required("DYN_CUSTOMER_NAME");
                let user_name = self.required("DYN_USER_NAME");
                let password = self.required("DYN_PASSWORD");
                Some(DnsProviderConfig::Dyn {
                    customer_name: customer_name?,
                    user_name: user_name?,
                    password: Secret::new(password?),
                })
            }
        }
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(format!("'{other}' is not a boolean (use true or false)")),
    }
}

fn parse_email(raw: &str) -> Result<String, String> {
    match raw.split_once('@') {
        Some((local, host)) if !local.is_empty() && host.contains('.') => Ok(raw.to_string()),
        _ => Err(format!("'{raw}' is not an email address")),
    }
}

fn parse_url(raw: &str) -> Result<String, String> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Ok(raw.trim_end_matches('/').to_string())
    } else {
        Err(format!("'{raw}' must start with http:// or https://"))
    }
}

fn parse_renewal_hour(raw: &str) -> Result<u32, String> {
    parse_ranged(raw, 0, 23).map(|hour| hour as u32)
}

fn parse_ranged(raw: &str, min: i64, max: i64) -> Result<i64, String> {
    let value: i64 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not an integer"))?;
    if value < min || value > max {
        return Err(format!("{value} is outside the range {min}..={max}"));
    }
    Ok(value)
}

/// Splits a comma separated domain list. Whitespace anywhere is ignored,
/// entries are normalized to lower-case ASCII, and empty or repeated entries
/// are rejected.
pub fn parse_domains(raw: &str) -> Result<Vec<String>, String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("no domains given".to_string());
    }
    let mut domains: Vec<String> = Vec::new();
    for (index, entry) in compact.split(',').enumerate() {
        if entry.is_empty() {
            return Err(format!("empty entry at position {}", index + 1));
        }
        let normalized =
            normalize_domain(entry).map_err(|err| format!("'{entry}': {err}"))?;
        if domains.contains(&normalized) {
            return Err(format!("duplicate domain '{normalized}'"));
        }
        domains.push(normalized);
    }
    Ok(domains)
}
