//! Suite configuration

use panelprobe_remote::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::playwright::PanelConfig;
use crate::poll::PollPolicy;

/// Everything a run needs besides the pipeline fixtures and the CLI credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Guest sessions
    pub session: SessionConfig,

    /// Control-plane state waits
    pub waits: WaitConfig,

    /// ICMP pre-check before the first session
    pub reachability: ReachabilityConfig,

    /// Browser-driven panel
    pub panel: PanelConfig,
}

/// SSH session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connection attempts per session
    pub retries: u32,

    /// Seconds between two attempts
    pub interval_secs: u64,

    pub port: u16,

    pub connect_timeout_secs: u64,

    /// Upper bound for one command to report completion
    pub command_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            interval_secs: 4,
            port: 22,
            connect_timeout_secs: 10,
            command_timeout_secs: 300,
        }
    }
}

/// Bounds for polled state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub transition_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            transition_timeout_secs: 300,
            poll_interval_secs: 2,
        }
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// Echo requests per probe
    pub probe_count: u32,

    /// Delay before the one retry of a failed probe
    pub retry_delay_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_count: 4,
            retry_delay_secs: 10,
        }
    }
}

impl SuiteConfig {
    /// Load configuration from file, defaults when the file does not exist
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.session.retries == 0 {
            anyhow::bail!("session.retries must be at least 1");
        }
        if self.waits.poll_interval_secs == 0 {
            anyhow::bail!("waits.poll_interval_secs must be at least 1");
        }
        if self.waits.transition_timeout_secs < self.waits.poll_interval_secs {
            anyhow::bail!("waits.transition_timeout_secs is shorter than one poll interval");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.session.retries,
            interval: Duration::from_secs(self.session.interval_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.session.command_timeout_secs)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.waits.poll_interval_secs),
            timeout: Duration::from_secs(self.waits.transition_timeout_secs),
        }
    }

    pub fn reachability_retry_delay(&self) -> Duration {
        Duration::from_secs(self.reachability.retry_delay_secs)
    }
}
