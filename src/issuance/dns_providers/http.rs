use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use reqwest::StatusCode;
use reqwest::blocking::Client;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub struct HttpClient;

impl HttpClient {
    /// Process-wide blocking client used by the DNS providers and the
    /// certificate store.
    pub fn shared() -> &'static Client {
        static CLIENT: OnceLock<Client> = OnceLock::new();
        CLIENT.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(request_timeout())
                .user_agent(concat!("acme-cert-renewer/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|err| {
                    warn!("[http] failed to build shared client: {err}");
                    reqwest::blocking::Client::new()
                })
        })
    }
}

/// Per-request timeout, from `HTTP_TIMEOUT_SECS` when set.
pub fn request_timeout() -> Duration {
    timeout_from(std::env::var("HTTP_TIMEOUT_SECS").ok().as_deref())
}

fn timeout_from(raw: Option<&str>) -> Duration {
    let Some(raw) = raw else {
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!("[http] invalid timeout value '{raw}'; using default");
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        }
    }
}

pub fn status_error(provider: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!("{provider} authentication failed");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!("{provider} rate limit exceeded");
    }
    if let Some(body) = body.filter(|b| !b.trim().is_empty()) {
        return anyhow!("{provider} API error ({status}): {body}");
    }
    anyhow!("{provider} API error: {status}")
}

#[cfg(test)]
mod tests {
    use super::{status_error, timeout_from};
    use reqwest::StatusCode;
    use std::time::Duration;

    #[test]
    fn status_error_maps_auth() {
        let err = status_error("Cloudflare", StatusCode::UNAUTHORIZED, None);
        assert!(err.to_string().contains("Cloudflare authentication failed"));
    }

    #[test]
    fn status_error_maps_rate_limit() {
        let err = status_error("DigitalOcean", StatusCode::TOO_MANY_REQUESTS, None);
        assert!(err.to_string().contains("DigitalOcean rate limit exceeded"));
    }

    #[test]
    fn status_error_includes_body() {
        let err = status_error(
            "DNSimple",
            StatusCode::BAD_REQUEST,
            Some("bad request".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("DNSimple API error"));
        assert!(msg.contains("bad request"));
    }

    #[test]
    fn timeout_defaults() {
        assert_eq!(timeout_from(None), Duration::from_secs(15));
    }

    #[test]
    fn timeout_parses_value() {
        assert_eq!(timeout_from(Some("20")), Duration::from_secs(20));
    }

    #[test]
    fn timeout_rejects_zero_and_garbage() {
        assert_eq!(timeout_from(Some("0")), Duration::from_secs(15));
        assert_eq!(timeout_from(Some("nope")), Duration::from_secs(15));
    }
}
