//! The provisioning control plane as the pipeline sees it
//!
//! All actions are fire-and-observe: returning `Ok(())` only means the action
//! was submitted. Callers confirm its effect by polling
//! [`ControlPlane::read_displayed_state`].

use async_trait::async_trait;
use panelprobe_common::{DisplayedInstance, InstanceRef, InstanceSpec, PowerState, Resize};

use crate::error::E2eResult;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Submit the create form for a new instance
    async fn create_instance(&self, spec: &InstanceSpec) -> E2eResult<()>;

    /// Request power on or off
    async fn set_power_state(&self, instance: &InstanceRef, state: PowerState) -> E2eResult<()>;

    /// Submit new sizing for a stopped instance
    async fn reconfigure(&self, instance: &InstanceRef, resize: &Resize) -> E2eResult<()>;

    /// What the panel currently shows for the instance named `name`, `None`
    /// when it lists no such instance
    async fn read_displayed_state(&self, name: &str) -> E2eResult<Option<DisplayedInstance>>;

    /// Request destruction of the instance
    async fn destroy_instance(&self, instance: &InstanceRef) -> E2eResult<()>;
}
