use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::issuance::dns::record_name;

use super::{ChallengeError, DnsChallengeAdapter};

const MAX_RECORD_CREATE_RETRIES: u32 = 3;
const RECORD_CREATE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Runs `operation` up to `max_attempts` times, doubling the delay after each
/// failure. Returns the first success or the last error.
fn retry_with_backoff<T, F>(mut operation: F, max_attempts: u32, delay: Duration) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = delay;
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                debug!(
                    "[dns-retry] operation failed (attempt {}), retrying in {}ms: {}",
                    attempt,
                    delay.as_millis(),
                    e
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// A TXT record as reported by a provider listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub value: String,
}

/// Low-level record operations each REST provider implements. Zone discovery
/// is the implementation's business.
pub trait AtomicDnsOperations: Send {
    /// Creates a single TXT record and returns its id.
    fn create_one_record(&mut self, record_name: &str, value: &str) -> Result<String>;

    fn delete_one_record(&mut self, record_name: &str, record_id: &str) -> Result<()>;

    /// Lists every TXT record at exactly `record_name`.
    fn list_records(&mut self, record_name: &str) -> Result<Vec<DnsRecord>>;

    /// Applies pending changes for providers that stage edits.
    fn commit(&mut self, _record_name: &str) -> Result<()> {
        Ok(())
    }

    /// Canonical form of a TXT value for comparison. Providers differ on
    /// whether they return the value quoted.
    fn normalize_value(&self, value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }
}

/// Implements the challenge contract on top of [`AtomicDnsOperations`]:
/// idempotent present, value-scoped clean up.
pub struct TxtRecordAdapter<O: AtomicDnsOperations> {
    provider: &'static str,
    ops: Mutex<O>,
}

impl<O: AtomicDnsOperations> TxtRecordAdapter<O> {
    pub fn new(provider: &'static str, ops: O) -> Self {
        Self {
            provider,
            ops: Mutex::new(ops),
        }
    }

    fn with_ops<T>(&self, f: impl FnOnce(&mut O) -> Result<T>) -> Result<T, ChallengeError> {
        let mut ops = match self.ops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut ops).map_err(|err| ChallengeError::classify(self.provider, err))
    }
}

impl<O: AtomicDnsOperations> DnsChallengeAdapter for TxtRecordAdapter<O> {
    fn provider(&self) -> &'static str {
        self.provider
    }

    fn present(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        let name = record_name(domain);
        let provider = self.provider;
        self.with_ops(|ops| {
            let wanted = ops.normalize_value(token);
            match ops.list_records(&name) {
                Ok(existing) => {
                    if existing
                        .iter()
                        .any(|record| ops.normalize_value(&record.value) == wanted)
                    {
                        debug!("[{}] {} already carries the challenge value", provider, name);
                        return Ok(());
                    }
                }
                Err(err) => {
                    debug!(
                        "[{}] failed to list existing records for {}, creating anyway: {}",
                        provider, name, err
                    );
                }
            }

            let id = retry_with_backoff(
                || ops.create_one_record(&name, token),
                MAX_RECORD_CREATE_RETRIES,
                RECORD_CREATE_RETRY_DELAY,
            )?;
            ops.commit(&name)?;
            info!("[{}] created TXT record {} (id {})", provider, name, id);
            Ok(())
        })
    }

    fn clean_up(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        let name = record_name(domain);
        let provider = self.provider;
        self.with_ops(|ops| {
            let wanted = ops.normalize_value(token);
            let matching: Vec<DnsRecord> = ops
                .list_records(&name)?
                .into_iter()
                .filter(|record| ops.normalize_value(&record.value) == wanted)
                .collect();
            if matching.is_empty() {
                debug!("[{}] nothing to clean up at {}", provider, name);
                return Ok(());
            }

            let mut first_error = None;
            let mut deleted = 0;
            for record in &matching {
                match ops.delete_one_record(&name, &record.id) {
                    Ok(()) => deleted += 1,
                    Err(err) => {
                        warn!(
                            "[{}] failed to delete record {} at {}: {}",
                            provider, record.id, name, err
                        );
                        first_error.get_or_insert(err);
                    }
                }
            }
            if deleted > 0 {
                ops.commit(&name)?;
            }
            match first_error {
                Some(err) => Err(err.context(format!(
                    "failed to delete {} of {} record(s) at {}",
                    matching.len() - deleted,
                    matching.len(),
                    name
                ))),
                None => {
                    info!("[{}] removed {} TXT record(s) at {}", provider, deleted, name);
                    Ok(())
                }
            }
        })
    }
}
