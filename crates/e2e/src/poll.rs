//! Condition polling with a deadline
//!
//! Every wait on an external system (panel status, displayed addresses, the
//! instance disappearing after destroy) goes through [`poll_until`]. A single
//! observation is never trusted: the probe is re-run until it reports ready or
//! the deadline passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

/// Interval and deadline for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// One probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    Ready(T),
    /// Not there yet; the description of what was seen ends up in the timeout error
    Pending(String),
}

/// Re-run `probe` every `policy.interval` until it reports ready.
///
/// Probe errors are treated as transient observations and polled again. When
/// the deadline passes the error names `what` and the last observation.
pub async fn poll_until<T, F, Fut>(what: &str, policy: PollPolicy, mut probe: F) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<Observation<T>>>,
{
    let start = Instant::now();
    let mut polls = 0u32;
    let mut last_seen = String::from("nothing observed");

    loop {
        polls += 1;
        match probe().await {
            Ok(Observation::Ready(value)) => {
                debug!("{} after {} poll(s), {:?}", what, polls, start.elapsed());
                return Ok(value);
            }
            Ok(Observation::Pending(seen)) => {
                if seen != last_seen {
                    debug!("Waiting for {}: {}", what, seen);
                }
                last_seen = seen;
            }
            Err(e) => {
                warn!("Waiting for {}: transient error: {}", what, e);
                last_seen = format!("error: {}", e);
            }
        }

        if start.elapsed() >= policy.timeout {
            return Err(E2eError::Timeout(format!(
                "{} ({}s elapsed, {} polls, last observed: {})",
                what,
                start.elapsed().as_secs(),
                polls,
                last_seen
            )));
        }

        sleep(policy.interval).await;
    }
}
