use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::{AtomicDnsOperations, DnsRecord, ZoneNotFound, best_zone, http};

const API_BASE: &str = "https://api.dynect.net/REST";

/// Dyn Managed DNS. Edits are staged and only served once the zone is
/// published, which [`AtomicDnsOperations::commit`] does.
pub struct DynOperations {
    customer_name: String,
    user_name: String,
    password: String,
    token: Option<String>,
    zones: Option<Vec<String>>,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    customer_name: &'a str,
    user_name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct DynResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    msgs: Vec<DynMessage>,
}

#[derive(Deserialize)]
struct DynMessage {
    #[serde(rename = "INFO", default)]
    info: String,
}

#[derive(Deserialize)]
struct SessionData {
    token: String,
}

#[derive(Deserialize)]
struct TxtRecordData {
    record_id: u64,
    #[serde(default)]
    fqdn: String,
    rdata: TxtRdata,
}

#[derive(Deserialize, Serialize)]
struct TxtRdata {
    txtdata: String,
}

#[derive(Serialize)]
struct NewTxtRecord {
    rdata: TxtRdata,
    ttl: u32,
}

#[derive(Serialize)]
struct PublishRequest {
    publish: bool,
}

impl<T> DynResponse<T> {
    fn into_data(self, what: &str) -> Result<T> {
        if self.status != "success" {
            let detail = self
                .msgs
                .iter()
                .map(|m| m.info.as_str())
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(anyhow!("Dyn {what} failed: {detail}"));
        }
        self.data
            .ok_or_else(|| anyhow!("Dyn {what} returned no data"))
    }
}

/// `/REST/Zone/example.com/` -> `example.com`
fn zone_from_uri(uri: &str) -> Option<String> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "Zone")
        .map(str::to_string)
}

impl DynOperations {
    pub fn new(customer_name: String, user_name: String, password: String) -> Self {
        Self {
            customer_name,
            user_name,
            password,
            token: None,
            zones: None,
        }
    }

    fn login(&mut self) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let client = http::HttpClient::shared();
        let response = client
            .post(format!("{API_BASE}/Session/"))
            .json(&SessionRequest {
                customer_name: &self.customer_name,
                user_name: &self.user_name,
                password: &self.password,
            })
            .send()
            .context("Failed to open Dyn session")?;
        if !response.status().is_success() {
            return Err(http::status_error("Dyn", response.status(), None));
        }
        let session: DynResponse<SessionData> =
            response.json().context("Failed to parse Dyn session response")?;
        let token = session.into_data("login")?.token;
        debug!("[dyn] session opened");
        self.token = Some(token.clone());
        Ok(token)
    }

    /// Sends an authenticated request, logging in again once if the session expired.
    fn send(&mut self, build: impl Fn(&str) -> RequestBuilder) -> Result<Response> {
        let token = self.login()?;
        let response = build(&token).send().context("Dyn request failed")?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!("[dyn] session rejected, logging in again");
        self.token = None;
        let token = self.login()?;
        build(&token).send().context("Dyn request failed")
    }

    fn zone_for(&mut self, record_name: &str) -> Result<String> {
        if self.zones.is_none() {
            let client = http::HttpClient::shared();
            let response = self.send(|token| {
                client
                    .get(format!("{API_BASE}/Zone/"))
                    .header("Auth-Token", token)
            })?;
            if !response.status().is_success() {
                return Err(http::status_error("Dyn", response.status(), None));
            }
            let zones: DynResponse<Vec<String>> =
                response.json().context("Failed to parse Dyn zone list")?;
            let names: Vec<String> = zones
                .into_data("zone list")?
                .iter()
                .filter_map(|uri| zone_from_uri(uri))
                .collect();
            self.zones = Some(names);
        }
        let zones = self.zones.as_deref().unwrap_or_default();
        best_zone(record_name, zones, |z| z.as_str())
            .cloned()
            .ok_or_else(|| ZoneNotFound(record_name.to_string()).into())
    }
}

impl AtomicDnsOperations for DynOperations {
    fn create_one_record(&mut self, record_name: &str, value: &str) -> Result<String> {
        let zone = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let body = NewTxtRecord {
            rdata: TxtRdata {
                txtdata: value.trim().trim_matches('"').to_string(),
            },
            ttl: 60,
        };
        let url = format!("{API_BASE}/TXTRecord/{zone}/{record_name}/");
        let response = self.send(|token| client.post(&url).header("Auth-Token", token).json(&body))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(http::status_error("Dyn", status, Some(text)));
        }
        let created: DynResponse<TxtRecordData> = response
            .json()
            .context("Failed to parse Dyn record response")?;
        Ok(created.into_data("record create")?.record_id.to_string())
    }

    fn delete_one_record(&mut self, record_name: &str, record_id: &str) -> Result<()> {
        let zone = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let url = format!("{API_BASE}/TXTRecord/{zone}/{record_name}/{record_id}/");
        let response = self.send(|token| client.delete(&url).header("Auth-Token", token))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(http::status_error("Dyn", status, None))
    }

    fn list_records(&mut self, record_name: &str) -> Result<Vec<DnsRecord>> {
        let zone = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let url = format!("{API_BASE}/TXTRecord/{zone}/{record_name}/?detail=Y");
        let response = self.send(|token| client.get(&url).header("Auth-Token", token))?;
        // Dyn answers 404 when the node has no TXT records.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(http::status_error("Dyn", response.status(), None));
        }
        let records: DynResponse<Vec<TxtRecordData>> = response
            .json()
            .context("Failed to parse Dyn record list")?;
        Ok(records
            .into_data("record list")?
            .into_iter()
            .map(|r| DnsRecord {
                id: r.record_id.to_string(),
                name: if r.fqdn.is_empty() {
                    record_name.to_string()
                } else {
                    r.fqdn
                },
                value: r.rdata.txtdata,
            })
            .collect())
    }

    fn commit(&mut self, record_name: &str) -> Result<()> {
        let zone = self.zone_for(record_name)?;
        let client = http::HttpClient::shared();
        let url = format!("{API_BASE}/Zone/{zone}/");
        let response = self.send(|token| {
            client
                .put(&url)
                .header("Auth-Token", token)
                .json(&PublishRequest { publish: true })
        })?;
        if !response.status().is_success() {
            return Err(http::status_error("Dyn", response.status(), None));
        }
        debug!("[dyn] published zone {}", zone);
        Ok(())
    }
}
