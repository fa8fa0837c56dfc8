use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::core::config::StoreSettings;
use crate::core::types::{Secret, inspect_certificate};
use crate::distribution::store::{
    CertificatePayload, CertificateStore, StoreError, StoredCertificate,
};
use crate::issuance::dns_providers::http;

const REMOVED_STATES: &[&str] = &["removed", "purged", "removing", "purging"];
const MAX_ERROR_BODY: usize = 512;

/// Certificate collection of the Rancher (cattle) API.
pub struct RancherStore {
    base_url: String,
    access_key: String,
    secret_key: Secret,
}

#[derive(Deserialize)]
struct CertificateCollection {
    #[serde(default)]
    data: Vec<RancherCertificate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RancherCertificate {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RancherCertificateBody<'a> {
    name: &'a str,
    description: &'a str,
    cert: &'a str,
    cert_chain: &'a str,
    key: &'a str,
}

impl<'a> From<&CertificatePayload<'a>> for RancherCertificateBody<'a> {
    fn from(payload: &CertificatePayload<'a>) -> Self {
        Self {
            name: payload.name,
            description: payload.description,
            cert: payload.certificate_pem,
            cert_chain: payload.chain_pem,
            key: payload.private_key_pem,
        }
    }
}

impl RancherStore {
    pub fn new(settings: &StoreSettings) -> Self {
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.access_key, Some(self.secret_key.expose()))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|err| StoreError::StoreUnreachable(transport_message(err)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(status_error(status, &body))
    }

    fn parse_written(&self, response: Response) -> Result<StoredCertificate, StoreError> {
        let cert: RancherCertificate = response
            .json()
            .map_err(|err| StoreError::InvalidResponse(err.to_string()))?;
        Ok(to_stored(cert))
    }
}

impl CertificateStore for RancherStore {
    fn list_certificates(&self, name: &str) -> Result<Vec<StoredCertificate>, StoreError> {
        let url = format!("{}/certificates", self.base_url);
        let response = self.send(
            http::HttpClient::shared()
                .get(&url)
                .query(&[("name", name)]),
        )?;
        let collection: CertificateCollection = response
            .json()
            .map_err(|err| StoreError::InvalidResponse(err.to_string()))?;
        let live: Vec<StoredCertificate> = collection
            .data
            .into_iter()
            .filter(|cert| !is_removed(cert.state.as_deref()))
            .map(to_stored)
            .collect();
        debug!("[store] {} live certificate(s) named '{name}'", live.len());
        Ok(live)
    }

    fn create_certificate(
        &self,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError> {
        let url = format!("{}/certificates", self.base_url);
        let body = RancherCertificateBody::from(payload);
        let response = self
            .send(http::HttpClient::shared().post(&url).json(&body))
            .map_err(|err| with_name(err, payload.name))?;
        self.parse_written(response)
    }

    fn update_certificate(
        &self,
        id: &str,
        payload: &CertificatePayload<'_>,
    ) -> Result<StoredCertificate, StoreError> {
        let url = format!("{}/certificates/{id}", self.base_url);
        let body = RancherCertificateBody::from(payload);
        let response = self
            .send(http::HttpClient::shared().put(&url).json(&body))
            .map_err(|err| with_name(err, payload.name))?;
        self.parse_written(response)
    }
}

fn is_removed(state: Option<&str>) -> bool {
    state.is_some_and(|state| REMOVED_STATES.contains(&state))
}

fn to_stored(cert: RancherCertificate) -> StoredCertificate {
    // The PEM is authoritative. Without it only the expiry is taken from the
    // API; its `issuer` field is a bare CN and cannot identify the environment.
    let parsed = cert
        .cert
        .as_deref()
        .filter(|pem| !pem.trim().is_empty())
        .and_then(|pem| match inspect_certificate(pem) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!("[store] certificate {} has an unreadable PEM: {err}", cert.id);
                None
            }
        });
    let (expires_at, issuer) = match parsed {
        Some(info) => (Some(info.not_after), Some(info.issuer)),
        None => (cert.expires_at.as_deref().and_then(parse_timestamp), None),
    };
    StoredCertificate {
        id: cert.id,
        name: cert.name.unwrap_or_default(),
        expires_at,
        issuer,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

fn transport_message(err: reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        // Strip the URL so query strings never reach the logs.
        err.without_url().to_string()
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::NotAuthorized,
        _ => {
            let mut message = body.trim().to_string();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            StoreError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn with_name(err: StoreError, name: &str) -> StoreError {
    match err {
        StoreError::Rejected { status: 409, .. } => StoreError::ConflictingName(name.to_string()),
        other => other,
    }
}
