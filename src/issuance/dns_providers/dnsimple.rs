use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::blocking::RequestBuilder;
use serde::{Deserialize, Serialize};

use super::{AtomicDnsOperations, DnsRecord, ZoneNotFound, best_zone, http, relative_name};

const API_BASE: &str = "https://api.dnsimple.com/v2";

/// DNSimple v2 API, authenticated with an account or user API token.
pub struct DnsSimpleOperations {
    api_token: String,
    account_id: Option<String>,
    zones: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct Pagination {
    current_page: u32,
    total_pages: u32,
}

#[derive(Deserialize)]
struct WhoAmI {
    account: Option<Account>,
}

#[derive(Deserialize)]
struct Account {
    id: u64,
}

#[derive(Deserialize)]
struct Zone {
    name: String,
}

#[derive(Deserialize)]
struct ZoneRecord {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct NewZoneRecord<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    content: &'a str,
    ttl: u32,
}

impl DnsSimpleOperations {
    pub fn new(api_token: String, account_id: Option<String>) -> Self {
        Self {
            api_token,
            account_id,
            zones: None,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Accept", "application/json")
    }

    fn account(&mut self) -> Result<String> {
        if let Some(id) = &self.account_id {
            return Ok(id.clone());
        }
        let client = http::HttpClient::shared();
        let response = self
            .authorize(client.get(format!("{API_BASE}/whoami")))
            .send()
            .context("Failed to query DNSimple account")?;
        if !response.status().is_success() {
            return Err(http::status_error("DNSimple", response.status(), None));
        }
        let whoami: Envelope<WhoAmI> = response
            .json()
            .context("Failed to parse DNSimple whoami response")?;
        let id = match whoami.data.account {
            Some(account) => account.id.to_string(),
            None => self.first_user_account()?,
        };
        debug!("[dnsimple] using account {}", id);
        self.account_id = Some(id.clone());
        Ok(id)
    }

    /// User tokens are not bound to one account; take the first one listed.
    fn first_user_account(&self) -> Result<String> {
        let client = http::HttpClient::shared();
        let response = self
            .authorize(client.get(format!("{API_BASE}/accounts")))
            .send()
            .context("Failed to list DNSimple accounts")?;
        if !response.status().is_success() {
            return Err(http::status_error("DNSimple", response.status(), None));
        }
        let accounts: Envelope<Vec<Account>> = response
            .json()
            .context("Failed to parse DNSimple account list")?;
        accounts
            .data
            .first()
            .map(|a| a.id.to_string())
            .ok_or_else(|| anyhow!("DNSimple token has no accessible account"))
    }

    fn zone_for(&mut self, record_name: &str) -> Result<(String, String)> {
        let account = self.account()?;
        if self.zones.is_none() {
            let client = http::HttpClient::shared();
            let mut names = Vec::new();
            let mut page = 1;
            loop {
                let response = self
                    .authorize(client.get(format!(
                        "{API_BASE}/{account}/zones?per_page=100&page={page}"
                    )))
                    .send()
                    .context("Failed to list DNSimple zones")?;
                if !response.status().is_success() {
                    return Err(http::status_error("DNSimple", response.status(), None));
                }
                let zones: Envelope<Vec<Zone>> = response
                    .json()
                    .context("Failed to parse DNSimple zone list")?;
                names.extend(zones.data.into_iter().map(|z| z.name));
                match zones.pagination {
                    Some(p) if p.current_page < p.total_pages => page = p.current_page + 1,
                    _ => break,
                }
            }
            self.zones = Some(names);
        }
        let zones = self.zones.as_deref().unwrap_or_default();
        let zone = best_zone(record_name, zones, |z| z.as_str())
            .cloned()
            .ok_or_else(|| ZoneNotFound(record_name.to_string()))?;
        Ok((account, zone))
    }
}

impl AtomicDnsOperations for DnsSimpleOperations {
    fn create_one_record(&mut self, record_name: &str, value: &str) -> Result<String> {
        let (account, zone) = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let name = relative_name(record_name, &zone);
        let content = value.trim().trim_matches('"');
        let body = NewZoneRecord {
            name: &name,
            record_type: "TXT",
            content,
            ttl: 60,
        };
        let response = self
            .authorize(client.post(format!("{API_BASE}/{account}/zones/{zone}/records")))
            .json(&body)
            .send()
            .context("Failed to create DNSimple DNS record")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(http::status_error("DNSimple", status, Some(text)));
        }
        let created: Envelope<ZoneRecord> = response
            .json()
            .context("Failed to parse DNSimple DNS record response")?;
        Ok(created.data.id.to_string())
    }

    fn delete_one_record(&mut self, record_name: &str, record_id: &str) -> Result<()> {
        let (account, zone) = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let response = self
            .authorize(client.delete(format!(
                "{API_BASE}/{account}/zones/{zone}/records/{record_id}"
            )))
            .send()
            .context("Failed to delete DNSimple DNS record")?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(http::status_error("DNSimple", status, None))
    }

    fn list_records(&mut self, record_name: &str) -> Result<Vec<DnsRecord>> {
        let (account, zone) = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let name = relative_name(record_name, &zone);
        let response = self
            .authorize(
                client
                    .get(format!("{API_BASE}/{account}/zones/{zone}/records"))
                    .query(&[("type", "TXT"), ("name", name.as_str())]),
            )
            .send()
            .context("Failed to list DNSimple DNS records")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(http::status_error("DNSimple", status, Some(text)));
        }
        let records: Envelope<Vec<ZoneRecord>> = response
            .json()
            .context("Failed to parse DNSimple DNS record list")?;
        Ok(records
            .data
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| DnsRecord {
                id: r.id.to_string(),
                name: record_name.to_string(),
                value: r.content,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whoami_for_account_token() {
        let parsed: Envelope<WhoAmI> =
            serde_json::from_str(r#"{"data":{"user":null,"account":{"id":1385,"email":"ops@example.com"}}}"#)
                .unwrap();
        assert_eq!(parsed.data.account.map(|a| a.id), Some(1385));
    }

    #[test]
    fn parses_record_list_with_pagination() {
        let parsed: Envelope<Vec<ZoneRecord>> = serde_json::from_str(
            r#"{"data":[{"id":5,"zone_id":"example.com","name":"_acme-challenge","content":"abc","type":"TXT"}],
                "pagination":{"current_page":1,"per_page":30,"total_entries":1,"total_pages":1}}"#,
        )
        .unwrap();
        assert_eq!(parsed.data[0].name, "_acme-challenge");
        let page = parsed.pagination.unwrap();
        assert_eq!((page.current_page, page.total_pages), (1, 1));
    }

    #[test]
    fn uses_configured_account_without_lookup() {
        let mut ops = DnsSimpleOperations::new("token".into(), Some("42".into()));
        assert_eq!(ops.account().unwrap(), "42");
    }
}
