//! Coarse ICMP reachability probe run before the first session attempt

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::E2eResult;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Number of echo requests sent per probe
    fn probe_count(&self) -> u32;

    /// `true` when the host answered
    async fn probe(&self, address: &str) -> E2eResult<bool>;
}

/// Probe backed by the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProbe {
    count: u32,
}

impl PingProbe {
    pub fn new(count: u32) -> Self {
        Self { count: count.max(1) }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    fn probe_count(&self) -> u32 {
        self.count
    }

    async fn probe(&self, address: &str) -> E2eResult<bool> {
        let count_flag = if cfg!(windows) { "-n" } else { "-c" };
        debug!("ping {} {} {}", count_flag, self.count, address);

        let status = Command::new("ping")
            .arg(count_flag)
            .arg(self.count.to_string())
            .arg(address)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        Ok(status.success())
    }
}
