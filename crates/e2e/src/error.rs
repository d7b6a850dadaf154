//! Error types for pipeline runs

use panelprobe_remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Panel at {url} did not answer after {attempts} attempts")]
    PanelUnavailable { url: String, attempts: usize },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Pipeline spec parse error: {0}")]
    SpecParse(String),

    #[error("Precondition failed for stage '{stage}': {reason}")]
    Precondition { stage: String, reason: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Assertion failed: {check} - expected {expected}, observed {observed}")]
    AssertionFailed {
        check: String,
        expected: String,
        observed: String,
    },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Host {address} did not answer {probes} ping probes, twice")]
    HostUnreachable { address: String, probes: u32 },

    #[error("Provisioning context error: {0}")]
    Context(#[from] panelprobe_common::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
