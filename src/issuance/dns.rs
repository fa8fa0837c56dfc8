use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::core::shutdown::ShutdownSignal;
use crate::domain::authorization_name;
use crate::issuance::dns_providers::{http, poll_dns_propagation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationState {
    Pending,
    Found,
    NxDomain,
    WrongContent,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsPropagationResult {
    pub state: PropagationState,
    pub reason: Option<String>,
    pub observed_values: Vec<String>,
}

/// Waits until a challenge TXT record is visible to public resolvers.
pub trait PropagationChecker: Send + Sync {
    fn wait_for_record(
        &self,
        record_name: &str,
        expected_value: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<DnsPropagationResult>;
}

/// Checks propagation through DNS-over-HTTPS resolvers with a bounded,
/// backing-off poll.
pub struct DohPropagationChecker {
    timeout: Duration,
    initial_interval: Duration,
}

impl DohPropagationChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_interval: Duration::from_secs(2),
        }
    }
}

impl PropagationChecker for DohPropagationChecker {
    fn wait_for_record(
        &self,
        record_name: &str,
        expected_value: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<DnsPropagationResult> {
        poll_dns_propagation(
            record_name,
            expected_value,
            self.timeout,
            self.initial_interval,
            shutdown,
        )
    }
}

/// TXT record name that carries the DNS-01 proof for `domain`.
pub fn record_name(domain: &str) -> String {
    let trimmed = authorization_name(domain);
    if trimmed.starts_with("_acme-challenge.") {
        trimmed.to_string()
    } else {
        format!("_acme-challenge.{trimmed}")
    }
}

fn query_txt(record_name: &str, expected_value: Option<&str>) -> Result<Vec<DohResponse>> {
    debug!("[dns] starting parallel DNS queries for {}", record_name);
    let urls = [
        (
            "Google DNS",
            format!("https://dns.google/resolve?name={record_name}&type=TXT&random_padding=x"),
        ),
        (
            "Cloudflare DNS",
            format!("https://cloudflare-dns.com/dns-query?name={record_name}&type=TXT"),
        ),
    ];

    let timeout = http::request_timeout();
    let (tx, rx) = mpsc::channel();

    for (resolver_name, url) in urls {
        let tx = tx.clone();
        let record_name = record_name.to_string();

        thread::spawn(move || {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            let result = agent
                .get(&url)
                .set("Accept", "application/dns-json")
                .call()
                .map_err(|err| anyhow!("query failed: {err}"))
                .and_then(|resp| {
                    resp.into_string()
                        .map_err(|err| anyhow!("body read failed: {err}"))
                })
                .and_then(|body| {
                    serde_json::from_str::<DohResponse>(&body)
                        .map_err(|err| anyhow!("parse failed: {err}"))
                });
            match &result {
                Ok(parsed) => debug!(
                    "[dns] {} responded for {}: status={}, has_answer={}",
                    resolver_name,
                    record_name,
                    parsed.status,
                    parsed.answer.is_some()
                ),
                Err(err) => warn!("[dns] {} failed for {}: {}", resolver_name, record_name, err),
            }
            let _ = tx.send(result);
        });
    }

    drop(tx);

    let mut results = Vec::new();
    for received in rx {
        let Ok(response) = received else {
            continue;
        };
        if let Some(expected) = expected_value
            && response_contains(&response, expected)
        {
            return Ok(vec![response]);
        }
        results.push(response);
    }

    if results.is_empty() {
        Err(anyhow!("dns query failed for {record_name} across resolvers"))
    } else {
        Ok(results)
    }
}

fn response_contains(response: &DohResponse, expected: &str) -> bool {
    response
        .answer
        .iter()
        .flatten()
        .filter_map(|ans| ans.data.as_deref())
        .any(|data| trim_txt_quotes(data) == expected)
}

/// One propagation check against the public resolvers.
pub fn check_txt_record(record_name: &str, expected_value: &str) -> Result<DnsPropagationResult> {
    let responses = query_txt(record_name, Some(expected_value))?;
    let result = interpret_dns_results(&responses, record_name, expected_value);
    info!(
        "[dns] check for {}: state={:?}, observed={:?}",
        record_name, result.state, result.observed_values
    );
    Ok(result)
}

fn trim_txt_quotes(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

#[derive(Debug, Deserialize, Clone)]
struct DohAnswer {
    #[serde(rename = "data")]
    data: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

fn interpret_dns_results(
    responses: &[DohResponse],
    record_name: &str,
    expected_value: &str,
) -> DnsPropagationResult {
    let mut observed = Vec::new();
    let mut saw_nxdomain = false;
    let mut saw_ok = false;

    for response in responses {
        if let Some(answers) = &response.answer {
            for ans in answers {
                if let Some(data) = &ans.data {
                    observed.push(trim_txt_quotes(data));
                }
            }
        }
        match response.status {
            0 => saw_ok = true,
            3 => saw_nxdomain = true,
            other => warn!("[dns] unexpected status {} for {}", other, record_name),
        }
    }

    let expected = trim_txt_quotes(expected_value);
    if observed.iter().any(|val| *val == expected) {
        return DnsPropagationResult {
            state: PropagationState::Found,
            reason: None,
            observed_values: observed,
        };
    }

    // Another SAN sharing this name (apex + wildcard) may hold a second value,
    // so a foreign value alone is not conclusive while the resolver says OK.
    if !observed.is_empty() {
        return DnsPropagationResult {
            state: PropagationState::WrongContent,
            reason: Some("TXT record present with different value".to_string()),
            observed_values: observed,
        };
    }

    if saw_ok {
        return DnsPropagationResult {
            state: PropagationState::Pending,
            reason: Some("record not found yet".to_string()),
            observed_values: observed,
        };
    }

    if saw_nxdomain {
        return DnsPropagationResult {
            state: PropagationState::NxDomain,
            reason: Some("record not found (NXDOMAIN)".to_string()),
            observed_values: observed,
        };
    }

    DnsPropagationResult {
        state: PropagationState::Error,
        reason: Some("no responses from DNS resolvers".to_string()),
        observed_values: observed,
    }
}
