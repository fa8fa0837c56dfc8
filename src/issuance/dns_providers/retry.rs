use anyhow::{Result, anyhow};
use log::{debug, warn};
use std::time::{Duration, Instant};

use crate::core::shutdown::ShutdownSignal;
use crate::issuance::dns::{DnsPropagationResult, PropagationState, check_txt_record};

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Polls public DNS (DoH) until the record carries `expected_value`, the
/// timeout elapses or shutdown is requested. The interval doubles after each
/// miss up to 30s.
///
/// Returns the last observed result; callers check `state == Found`. Query
/// failures are retried like misses and only surface when time runs out.
pub fn poll_dns_propagation(
    record_name: &str,
    expected_value: &str,
    timeout: Duration,
    initial_interval: Duration,
    shutdown: &ShutdownSignal,
) -> Result<DnsPropagationResult> {
    let started = Instant::now();
    let mut interval = initial_interval;
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            "[dns-retry] propagation check attempt {} for {}",
            attempt, record_name
        );

        let outcome = check_txt_record(record_name, expected_value);
        let last = match outcome {
            Ok(result) if result.state == PropagationState::Found => {
                debug!(
                    "[dns-retry] record found after {}ms (attempt {})",
                    started.elapsed().as_millis(),
                    attempt
                );
                return Ok(result);
            }
            Ok(result) => result,
            Err(err) => {
                if started.elapsed() >= timeout {
                    warn!(
                        "[dns-retry] propagation check failed after {}ms (attempt {}): {}",
                        started.elapsed().as_millis(),
                        attempt,
                        err
                    );
                    return Err(err);
                }
                debug!("[dns-retry] DNS query failed (attempt {}): {}", attempt, err);
                DnsPropagationResult {
                    state: PropagationState::Error,
                    reason: Some(err.to_string()),
                    observed_values: Vec::new(),
                }
            }
        };

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(
                "[dns-retry] propagation timeout after {}ms (attempt {}), last state: {:?}",
                elapsed.as_millis(),
                attempt,
                last.state
            );
            return Ok(last);
        }

        let wait = interval.min(timeout - elapsed);
        debug!(
            "[dns-retry] record not visible yet (state={:?}), waiting {}s ({}s remaining)",
            last.state,
            wait.as_secs(),
            (timeout - elapsed).as_secs()
        );
        if !shutdown.sleep(wait) {
            debug!("[dns-retry] shutdown requested while waiting for {}", record_name);
            return Ok(DnsPropagationResult {
                reason: Some("cancelled".to_string()),
                ..last
            });
        }
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Re-runs `verify` against the provider API until it reports the change as
/// visible. `Ok(false)` means "not yet"; an error ends the wait at once.
pub fn retry_provider_verification<F>(
    record_name: &str,
    operation: &str,
    timeout: Duration,
    interval: Duration,
    mut verify: F,
) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    for attempt in 1.. {
        if verify().inspect_err(|err| {
            warn!("[provider-retry] {operation} for {record_name} failed: {err}")
        })? {
            debug!("[provider-retry] {operation} for {record_name} confirmed (attempt {attempt})");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
    warn!("[provider-retry] {operation} for {record_name} not confirmed within {timeout:?}");
    Err(anyhow!(
        "{operation} for {record_name} not confirmed: timeout after {}ms",
        timeout.as_millis()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn verify_with(timeout_ms: u64, answers: impl Fn(u32) -> Result<bool>) -> (Result<()>, u32) {
        let calls = Cell::new(0);
        let result = retry_provider_verification(
            "_acme-challenge.example.com",
            "record check",
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
            || {
                calls.set(calls.get() + 1);
                answers(calls.get())
            },
        );
        (result, calls.get())
    }

    #[test]
    fn confirms_on_first_visible_answer() {
        let (result, calls) = verify_with(1000, |_| Ok(true));
        assert!(result.is_ok());
        assert_eq!(calls, 1);
    }

    #[test]
    fn keeps_asking_until_visible() {
        let (result, calls) = verify_with(2000, |n| Ok(n >= 3));
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_timeout() {
        let (result, calls) = verify_with(60, |_| Ok(false));
        assert!(result.unwrap_err().to_string().contains("timeout"));
        assert!(calls >= 2);
    }

    #[test]
    fn provider_error_stops_immediately() {
        let (result, calls) = verify_with(1000, |_| Err(anyhow!("403 forbidden")));
        assert!(result.unwrap_err().to_string().contains("403"));
        assert_eq!(calls, 1);
    }
}
