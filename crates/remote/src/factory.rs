//! Session factory - bounded retries against hosts that may still be booting

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::session::{CommandResult, RemoteSession};
use crate::transport::Connector;

/// How often and how patiently to attempt a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one is always made
    pub retries: u32,
    /// Delay between two attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            interval: Duration::from_secs(4),
        }
    }
}

/// Blocking delay between attempts
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// [`Pause`] backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Establishes [`RemoteSession`]s with bounded retries
#[derive(Clone)]
pub struct SessionFactory {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    command_timeout: Duration,
    pause: Arc<dyn Pause>,
}

impl SessionFactory {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy, command_timeout: Duration) -> Self {
        Self {
            connector,
            policy,
            command_timeout,
            pause: Arc::new(ThreadPause),
        }
    }

    /// Replace the delay implementation (tests record pauses instead of sleeping)
    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Open a session to `address`.
    ///
    /// Makes at most `policy.retries` attempts and pauses `policy.interval`
    /// between two of them, never after the last. Returns `Ok(None)` when the
    /// host stayed unreachable for every attempt. Rejected credentials and
    /// other non-transient failures are returned immediately.
    pub fn acquire(&self, address: &str, username: &str, password: &str) -> RemoteResult<Option<RemoteSession>> {
        let attempts = self.policy.retries.max(1);

        for attempt in 1..=attempts {
            match self.connector.connect(address, username, password) {
                Ok(link) => {
                    info!("SSH session to {}@{} established (attempt {}/{})", username, address, attempt, attempts);
                    return Ok(Some(RemoteSession::new(address, username, link, self.command_timeout)));
                }
                Err(RemoteError::Unreachable { reason, .. }) => {
                    warn!("SSH attempt {}/{} to {} failed: {}", attempt, attempts, address, reason);
                    if attempt < attempts {
                        self.pause.pause(self.policy.interval);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Acquire a session, run one command, release the session
    pub fn run_once(&self, address: &str, username: &str, password: &str, command: &str) -> RemoteResult<CommandResult> {
        let mut session = self
            .acquire(address, username, password)?
            .ok_or_else(|| RemoteError::RetriesExhausted {
                address: address.to_string(),
                attempts: self.policy.retries.max(1),
            })?;

        let result = session.execute(command);
        // The command outcome wins over a failed disconnect.
        if let Err(e) = session.close() {
            warn!("Closing one-shot session to {} failed: {}", address, e);
        }
        result
    }
}

/// One-shot command with an ad-hoc factory
pub fn run_once(
    connector: Arc<dyn Connector>,
    address: &str,
    username: &str,
    password: &str,
    command: &str,
    policy: RetryPolicy,
    command_timeout: Duration,
) -> RemoteResult<CommandResult> {
    SessionFactory::new(connector, policy, command_timeout).run_once(address, username, password, command)
}
