use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::blocking::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    AtomicDnsOperations, DnsRecord, ZoneNotFound, best_zone, http, retry_provider_verification,
};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DUPLICATE_RECORD_CODE: u32 = 81058;

enum Credentials {
    Token(String),
    GlobalKey { email: String, key: String },
}

pub struct CloudflareOperations {
    credentials: Credentials,
    zones: Option<Vec<CloudflareZone>>,
}

#[derive(Deserialize, Clone)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct CloudflareZoneListResponse {
    result: Vec<CloudflareZone>,
    success: bool,
    #[serde(default)]
    result_info: Option<CloudflareResultInfo>,
}

#[derive(Deserialize)]
struct CloudflareResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Serialize)]
struct CloudflareDnsRecord {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResponse {
    result: Option<CloudflareDnsRecordResult>,
    success: bool,
    errors: Option<Vec<CloudflareError>>,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordListResponse {
    result: Vec<CloudflareDnsRecordResult>,
    success: bool,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResult {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareError {
    code: u32,
    message: String,
}

fn describe_errors(errors: Option<Vec<CloudflareError>>) -> String {
    errors
        .map(|e| {
            e.iter()
                .map(|err| format!("{}: {}", err.code, err.message))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

fn is_duplicate(errors: &Option<Vec<CloudflareError>>) -> bool {
    errors
        .as_ref()
        .map(|errs| errs.iter().any(|err| err.code == DUPLICATE_RECORD_CODE))
        .unwrap_or(false)
}

impl CloudflareOperations {
    pub fn with_token(api_token: String) -> Self {
        Self {
            credentials: Credentials::Token(api_token),
            zones: None,
        }
    }

    pub fn with_global_key(email: String, key: String) -> Self {
        Self {
            credentials: Credentials::GlobalKey { email, key },
            zones: None,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        match &self.credentials {
            Credentials::Token(token) => request.header("Authorization", format!("Bearer {token}")),
            Credentials::GlobalKey { email, key } => request
                .header("X-Auth-Email", email.as_str())
                .header("X-Auth-Key", key.as_str()),
        }
    }

    fn format_txt_content(value: &str) -> String {
        format!("\"{}\"", value.trim().trim_matches('"'))
    }

    fn load_zones(&mut self) -> Result<&[CloudflareZone]> {
        if self.zones.is_none() {
            let client = http::HttpClient::shared();
            let mut zones = Vec::new();
            let mut page = 1;
            loop {
                let response = self
                    .authorize(client.get(format!("{API_BASE}/zones?per_page=50&page={page}")))
                    .send()
                    .context("Failed to list Cloudflare zones")?;
                if !response.status().is_success() {
                    return Err(http::status_error("Cloudflare", response.status(), None));
                }
                let zone_list: CloudflareZoneListResponse = response
                    .json()
                    .context("Failed to parse Cloudflare zone list response")?;
                if !zone_list.success {
                    return Err(anyhow!("Cloudflare API returned unsuccessful response"));
                }
                zones.extend(zone_list.result);
                match zone_list.result_info {
                    Some(info) if info.page < info.total_pages => page = info.page + 1,
                    _ => break,
                }
            }
            debug!("[cloudflare] discovered {} zone(s)", zones.len());
            self.zones = Some(zones);
        }
        Ok(self.zones.as_deref().unwrap_or_default())
    }

    fn zone_id_for(&mut self, record_name: &str) -> Result<String> {
        let zones = self.load_zones()?;
        best_zone(record_name, zones, |z| z.name.as_str())
            .map(|zone| zone.id.clone())
            .ok_or_else(|| ZoneNotFound(record_name.to_string()).into())
    }

    fn verify_record_content(&self, zone_id: &str, record_id: &str, expected: &str) -> Result<()> {
        let url = format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}");
        retry_provider_verification(
            &format!("record {record_id}"),
            "Cloudflare record verification",
            Duration::from_secs(2),
            Duration::from_millis(300),
            || {
                let client = http::HttpClient::shared();
                let check_response = self
                    .authorize(client.get(&url))
                    .send()
                    .context("Failed to fetch Cloudflare DNS record")?;
                if !check_response.status().is_success() {
                    return Ok(false);
                }
                let check_result: CloudflareDnsRecordResponse = check_response
                    .json()
                    .context("Failed to parse Cloudflare DNS record response")?;
                Ok(check_result
                    .result
                    .and_then(|record| record.content)
                    .map(|content| content == expected)
                    .unwrap_or(false))
            },
        )
    }
}

impl AtomicDnsOperations for CloudflareOperations {
    fn create_one_record(&mut self, record_name: &str, value: &str) -> Result<String> {
        let zone_id = self.zone_id_for(record_name)?;
        let client = http::HttpClient::shared();
        let formatted_value = Self::format_txt_content(value);

        let record = CloudflareDnsRecord {
            record_type: "TXT".to_string(),
            name: record_name.to_string(),
            content: formatted_value.clone(),
            ttl: 120,
        };

        let response = self
            .authorize(client.post(format!("{API_BASE}/zones/{zone_id}/dns_records")))
            .json(&record)
            .send()
            .context("Failed to create Cloudflare DNS record")?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        let parsed = serde_json::from_str::<CloudflareDnsRecordResponse>(&body).ok();

        if let Some(parsed) = &parsed
            && is_duplicate(&parsed.errors)
        {
            // An identical record already exists; hand back its id.
            let existing = self.list_records(record_name)?;
            return existing
                .into_iter()
                .find(|r| self.normalize_value(&r.value) == self.normalize_value(value))
                .map(|r| r.id)
                .ok_or_else(|| anyhow!("Cloudflare reported a duplicate for {record_name} but none was listed"));
        }

        if !status.is_success() {
            return Err(http::status_error("Cloudflare", status, Some(body)));
        }

        let result = parsed.ok_or_else(|| anyhow!("Failed to parse Cloudflare DNS record response"))?;
        if !result.success {
            return Err(anyhow!("Cloudflare API error: {}", describe_errors(result.errors)));
        }

        let record_id = result
            .result
            .map(|r| r.id)
            .ok_or_else(|| anyhow!("Cloudflare API did not return record ID"))?;

        self.verify_record_content(&zone_id, &record_id, &formatted_value)?;
        Ok(record_id)
    }

    fn delete_one_record(&mut self, record_name: &str, record_id: &str) -> Result<()> {
        let zone_id = self.zone_id_for(record_name)?;
        let client = http::HttpClient::shared();
        let response = self
            .authorize(client.delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}")))
            .send()
            .context("Failed to delete Cloudflare DNS record")?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(http::status_error("Cloudflare", status, Some(body)))
    }

    fn list_records(&mut self, record_name: &str) -> Result<Vec<DnsRecord>> {
        let zone_id = self.zone_id_for(record_name)?;
        let client = http::HttpClient::shared();
        let response = self
            .authorize(client.get(format!(
                "{API_BASE}/zones/{zone_id}/dns_records?type=TXT&name={record_name}"
            )))
            .send()
            .context("Failed to list Cloudflare DNS records")?;

        if !response.status().is_success() {
            return Err(http::status_error("Cloudflare", response.status(), None));
        }

        let list_result: CloudflareDnsRecordListResponse = response
            .json()
            .context("Failed to parse Cloudflare DNS record list")?;
        if !list_result.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }

        Ok(list_result
            .result
            .into_iter()
            .map(|r| DnsRecord {
                id: r.id,
                name: r.name.unwrap_or_else(|| record_name.to_string()),
                value: r.content.unwrap_or_default(),
            })
            .collect())
    }
}
