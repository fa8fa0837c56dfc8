use std::future::Future;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use aws_config::BehaviorVersion;
use aws_sdk_route53::Client;
use aws_sdk_route53::config::{Credentials, Region};
use aws_sdk_route53::error::{DisplayErrorContext, SdkError};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use log::{debug, info};

use crate::issuance::dns::record_name;

use super::{
    ChallengeError, DnsChallengeAdapter, ProviderUnreachable, ZoneNotFound, best_zone,
};

const DEFAULT_REGION: &str = "us-east-1";
const PROVIDER: &str = "route53";
const TXT_TTL: i64 = 60;

/// Route 53 keeps every value for a name in one record set, so present and
/// clean up rewrite the set instead of adding or removing single records.
pub struct Route53Adapter {
    access_key: String,
    secret_key: String,
    region: String,
    hosted_zones: Mutex<Option<Vec<(String, String)>>>,
}

fn sdk_failure<E, R>(err: SdkError<E, R>, what: &str) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{what}: {}", DisplayErrorContext(&err));
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        ProviderUnreachable(message).into()
    } else {
        anyhow!(message)
    }
}

/// Runs the SDK future from blocking code, reusing the ambient runtime when
/// there is one.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
            Ok(rt.block_on(future))
        }
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.trim().trim_matches('"'))
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

fn strip_zone_prefix(id: &str) -> String {
    id.trim_start_matches("/hostedzone/").to_string()
}

impl Route53Adapter {
    pub fn new(access_key: String, secret_key: String, region: Option<String>) -> Self {
        Self {
            access_key,
            secret_key,
            region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            hosted_zones: Mutex::new(None),
        }
    }

    async fn client(&self) -> Client {
        let credentials = Credentials::new(
            &self.access_key,
            &self.secret_key,
            None,
            None,
            "acme-cert-renewer",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        Client::new(&config)
    }

    async fn hosted_zone_id(&self, client: &Client, record: &str) -> Result<String> {
        let cached = match self.hosted_zones.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let zones = match cached {
            Some(zones) => zones,
            None => {
                let mut zones = Vec::new();
                let mut paginator = client
                    .list_hosted_zones()
                    .into_paginator()
                    .page_size(100)
                    .send();
                while let Some(page) = paginator.next().await {
                    let page = page.map_err(|e| sdk_failure(e, "Failed to list Route 53 hosted zones"))?;
                    for zone in page.hosted_zones() {
                        zones.push((zone.name().to_string(), strip_zone_prefix(zone.id())));
                    }
                }
                debug!("[route53] discovered {} hosted zone(s)", zones.len());
                match self.hosted_zones.lock() {
                    Ok(mut guard) => *guard = Some(zones.clone()),
                    Err(poisoned) => *poisoned.into_inner() = Some(zones.clone()),
                }
                zones
            }
        };
        best_zone(record, &zones, |(name, _)| name.as_str())
            .map(|(_, id)| id.clone())
            .ok_or_else(|| ZoneNotFound(record.to_string()).into())
    }

    async fn current_values(&self, client: &Client, zone_id: &str, name: &str) -> Result<Vec<String>> {
        let response = client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(name)
            .start_record_type(RrType::Txt)
            .max_items(1)
            .send()
            .await
            .map_err(|e| sdk_failure(e, "Failed to list Route 53 DNS records"))?;

        Ok(response
            .resource_record_sets()
            .iter()
            .find(|rs| rs.name().eq_ignore_ascii_case(name) && rs.r#type() == &RrType::Txt)
            .map(|rs| {
                rs.resource_records()
                    .iter()
                    .map(|r| r.value().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_values(
        &self,
        client: &Client,
        zone_id: &str,
        name: &str,
        action: ChangeAction,
        values: &[String],
    ) -> Result<()> {
        let records = values
            .iter()
            .map(|value| {
                ResourceRecord::builder()
                    .value(value.clone())
                    .build()
                    .map_err(|e| anyhow!("Failed to build ResourceRecord: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let record_set = ResourceRecordSet::builder()
            .name(name)
            .set_type(Some(RrType::Txt))
            .ttl(TXT_TTL)
            .set_resource_records(Some(records))
            .build()
            .map_err(|e| anyhow!("Failed to build ResourceRecordSet: {e}"))?;

        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| anyhow!("Failed to build Change: {e}"))?;

        let change_batch = ChangeBatch::builder()
            .changes(change)
            .build()
            .map_err(|e| anyhow!("Failed to build ChangeBatch: {e}"))?;

        client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(change_batch)
            .send()
            .await
            .map_err(|e| sdk_failure(e, "Failed to change Route 53 DNS records"))?;
        Ok(())
    }

    async fn upsert_value(&self, record: &str, token: &str) -> Result<()> {
        let client = self.client().await;
        let zone_id = self.hosted_zone_id(&client, record).await?;
        let name = fqdn(record);
        let wanted = quoted(token);

        let mut values = self.current_values(&client, &zone_id, &name).await?;
        if values.contains(&wanted) {
            debug!("[route53] {} already carries the challenge value", record);
            return Ok(());
        }
        values.push(wanted);
        self.write_values(&client, &zone_id, &name, ChangeAction::Upsert, &values)
            .await?;
        info!("[route53] upserted TXT record {} ({} value(s))", record, values.len());
        Ok(())
    }

    async fn remove_value(&self, record: &str, token: &str) -> Result<()> {
        let client = self.client().await;
        let zone_id = self.hosted_zone_id(&client, record).await?;
        let name = fqdn(record);
        let wanted = quoted(token);

        let values = self.current_values(&client, &zone_id, &name).await?;
        if !values.contains(&wanted) {
            debug!("[route53] nothing to clean up at {}", record);
            return Ok(());
        }
        let remaining = remaining_values(&values, &wanted);
        if remaining.is_empty() {
            // DELETE must name the record set exactly as it exists.
            self.write_values(&client, &zone_id, &name, ChangeAction::Delete, &values)
                .await?;
        } else {
            self.write_values(&client, &zone_id, &name, ChangeAction::Upsert, &remaining)
                .await?;
        }
        info!("[route53] removed challenge value at {}", record);
        Ok(())
    }
}

fn remaining_values(values: &[String], removed: &str) -> Vec<String> {
    values.iter().filter(|v| v.as_str() != removed).cloned().collect()
}

impl DnsChallengeAdapter for Route53Adapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn present(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        let record = record_name(domain);
        block_on(self.upsert_value(&record, token))
            .and_then(|inner| inner)
            .map_err(|err| ChallengeError::classify(PROVIDER, err))
    }

    fn clean_up(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        let record = record_name(domain);
        block_on(self.remove_value(&record, token))
            .and_then(|inner| inner)
            .map_err(|err| ChallengeError::classify(PROVIDER, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_quoted_once() {
        assert_eq!(quoted("abc"), "\"abc\"");
        assert_eq!(quoted("\"abc\""), "\"abc\"");
    }

    #[test]
    fn names_are_fully_qualified() {
        assert_eq!(fqdn("_acme-challenge.example.com"), "_acme-challenge.example.com.");
        assert_eq!(fqdn("_acme-challenge.example.com."), "_acme-challenge.example.com.");
    }

    #[test]
    fn hosted_zone_ids_lose_their_prefix() {
        assert_eq!(strip_zone_prefix("/hostedzone/Z123ABC"), "Z123ABC");
        assert_eq!(strip_zone_prefix("Z123ABC"), "Z123ABC");
    }

    #[test]
    fn removing_one_value_keeps_the_others() {
        let values = vec!["\"apex\"".to_string(), "\"wildcard\"".to_string()];
        assert_eq!(remaining_values(&values, "\"apex\""), vec!["\"wildcard\"".to_string()]);
        assert!(remaining_values(&values[..1], "\"apex\"").is_empty());
    }

    #[test]
    fn region_defaults_to_us_east_1() {
        let adapter = Route53Adapter::new("AKIA".into(), "secret".into(), None);
        assert_eq!(adapter.region, "us-east-1");
        assert_eq!(adapter.provider(), "route53");
    }
}
