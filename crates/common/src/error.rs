//! Error types for PanelProbe

use thiserror::Error;

/// Result type alias using the PanelProbe common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared provisioning types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{field} is already assigned ({current}); refusing to overwrite with {attempted}")]
    AlreadyAssigned {
        field: &'static str,
        current: String,
        attempted: String,
    },

    #[error("{field} is not assigned yet")]
    Unassigned { field: &'static str },

    #[error("Invalid instance spec: {0}")]
    InvalidSpec(String),
}
