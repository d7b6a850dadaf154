//! PanelProbe Common Library
//!
//! Shared types for the PanelProbe workspace: the provisioning context that
//! pipeline stages pass between each other, the instance description handed
//! to the control plane, and the instance view the control plane displays.

pub mod context;
pub mod error;
pub mod types;

pub use context::{AddressUpdate, ContextSnapshot, ProvisioningContext, WriteOnce, ADMIN_USERNAME};
pub use error::{Error, Result};
pub use types::*;

/// PanelProbe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
