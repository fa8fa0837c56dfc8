use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    AtomicDnsOperations, DnsRecord, ZoneNotFound, best_zone, http, relative_name,
    retry_provider_verification,
};

const API_BASE: &str = "https://api.digitalocean.com/v2";

pub struct DigitalOceanOperations {
    api_token: String,
    domains: Option<Vec<String>>,
}

#[derive(Serialize)]
struct DigitalOceanDnsRecord {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResponse {
    domain_record: DigitalOceanDnsRecordItem,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordListResponse {
    domain_records: Vec<DigitalOceanDnsRecordItem>,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordItem {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct DigitalOceanDomainListResponse {
    domains: Vec<DigitalOceanDomain>,
    #[serde(default)]
    links: Option<DigitalOceanLinks>,
}

#[derive(Deserialize)]
struct DigitalOceanDomain {
    name: String,
}

#[derive(Deserialize, Default)]
struct DigitalOceanLinks {
    #[serde(default)]
    pages: Option<DigitalOceanPages>,
}

#[derive(Deserialize, Default)]
struct DigitalOceanPages {
    #[serde(default)]
    next: Option<String>,
}

impl DigitalOceanOperations {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            domains: None,
        }
    }

    /// DigitalOcean addresses records relative to their domain, `@` for the apex.
    fn to_relative_name(record_name: &str, domain: &str) -> String {
        let relative = relative_name(record_name, domain);
        if relative.is_empty() {
            "@".to_string()
        } else {
            relative
        }
    }

    /// DigitalOcean quotes TXT data itself.
    fn format_txt_content(value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }

    fn domain_for(&mut self, record_name: &str) -> Result<String> {
        if self.domains.is_none() {
            let client = http::HttpClient::shared();
            let mut names = Vec::new();
            let mut next = Some(format!("{API_BASE}/domains?per_page=200"));
            while let Some(url) = next.take() {
                let response = client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", self.api_token))
                    .send()
                    .context("Failed to list DigitalOcean domains")?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().unwrap_or_default();
                    return Err(http::status_error("DigitalOcean", status, Some(body)));
                }
                let page: DigitalOceanDomainListResponse = response
                    .json()
                    .context("Failed to parse DigitalOcean domain list")?;
                names.extend(page.domains.into_iter().map(|d| d.name));
                next = page.links.and_then(|l| l.pages).and_then(|p| p.next);
            }
            debug!("[digitalocean] discovered {} domain(s)", names.len());
            self.domains = Some(names);
        }
        let domains = self.domains.as_deref().unwrap_or_default();
        best_zone(record_name, domains, |d| d.as_str())
            .cloned()
            .ok_or_else(|| ZoneNotFound(record_name.to_string()).into())
    }

    fn fetch_record_data(&self, domain: &str, record_id: u64) -> Result<Option<String>> {
        let client = http::HttpClient::shared();
        let response = client
            .get(format!("{API_BASE}/domains/{domain}/records/{record_id}"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to fetch DigitalOcean DNS record")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(error_text)));
        }

        let record: DigitalOceanDnsRecordResponse = response
            .json()
            .context("Failed to parse DigitalOcean DNS record response")?;
        Ok(record.domain_record.data)
    }
}

impl AtomicDnsOperations for DigitalOceanOperations {
    fn create_one_record(&mut self, record_name: &str, value: &str) -> Result<String> {
        let domain = self.domain_for(record_name)?;
        let client = http::HttpClient::shared();
        let data = Self::format_txt_content(value);

        let record = DigitalOceanDnsRecord {
            record_type: "TXT".to_string(),
            name: Self::to_relative_name(record_name, &domain),
            data: data.clone(),
            ttl: 300,
        };

        let response = client
            .post(format!("{API_BASE}/domains/{domain}/records"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .json(&record)
            .send()
            .context("Failed to create DigitalOcean DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(error_text)));
        }

        let result: DigitalOceanDnsRecordResponse = response
            .json()
            .context("Failed to parse DigitalOcean DNS record response")?;
        let record_id = result.domain_record.id;

        retry_provider_verification(
            record_name,
            "DigitalOcean record verification",
            Duration::from_secs(3),
            Duration::from_millis(500),
            || {
                Ok(self
                    .fetch_record_data(&domain, record_id)?
                    .map(|found| Self::format_txt_content(&found) == data)
                    .unwrap_or(false))
            },
        )?;

        Ok(record_id.to_string())
    }

    fn delete_one_record(&mut self, record_name: &str, record_id: &str) -> Result<()> {
        let domain = self.domain_for(record_name)?;
        let client = http::HttpClient::shared();
        let response = client
            .delete(format!("{API_BASE}/domains/{domain}/records/{record_id}"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to delete DigitalOcean DNS record")?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(http::status_error("DigitalOcean", status, None))
    }

    fn list_records(&mut self, record_name: &str) -> Result<Vec<DnsRecord>> {
        let domain = self.domain_for(record_name)?;
        let client = http::HttpClient::shared();
        let response = client
            .get(format!(
                "{API_BASE}/domains/{domain}/records?type=TXT&name={}",
                record_name.trim_end_matches('.')
            ))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to list DigitalOcean DNS records")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(body)));
        }

        let list_result: DigitalOceanDnsRecordListResponse = response
            .json()
            .context("Failed to parse DigitalOcean DNS record list")?;

        let relative = Self::to_relative_name(record_name, &domain);
        Ok(list_result
            .domain_records
            .into_iter()
            .filter(|r| r.name == relative)
            .map(|r| DnsRecord {
                id: r.id.to_string(),
                name: record_name.to_string(),
                value: r.data.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::DigitalOceanOperations;

    #[test]
    fn relative_name_for_subdomain_and_apex() {
        assert_eq!(
            DigitalOceanOperations::to_relative_name("_acme-challenge.example.com", "example.com"),
            "_acme-challenge"
        );
        assert_eq!(
            DigitalOceanOperations::to_relative_name("example.com", "example.com"),
            "@"
        );
    }

    #[test]
    fn txt_content_is_unquoted() {
        assert_eq!(DigitalOceanOperations::format_txt_content("\"abc\" "), "abc");
    }
}
