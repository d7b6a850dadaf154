//! Provisioning context shared by the stages of one pipeline
//!
//! A context describes exactly one instance under test. It is created empty
//! (apart from the instance spec) when a pipeline starts and is handed by
//! mutable reference to each stage in order. The instance id and the assigned
//! addresses are write-once: they are recorded after the control-plane action
//! that produced them and never overwritten.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{InstanceId, InstanceRef, InstanceSpec, Resize, Sizing};

/// Administrative user every in-guest session authenticates as
pub const ADMIN_USERNAME: &str = "root";

/// A value that may be assigned exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOnce<T> {
    field: &'static str,
    value: Option<T>,
}

impl<T: std::fmt::Display> WriteOnce<T> {
    pub fn new(field: &'static str) -> Self {
        Self { field, value: None }
    }

    /// Assign the value. Fails if a value is already present, even an equal one.
    pub fn set(&mut self, value: T) -> Result<()> {
        if let Some(current) = &self.value {
            return Err(Error::AlreadyAssigned {
                field: self.field,
                current: current.to_string(),
                attempted: value.to_string(),
            });
        }
        debug!("{} = {}", self.field, value);
        self.value = Some(value);
        Ok(())
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn require(&self) -> Result<&T> {
        self.value
            .as_ref()
            .ok_or(Error::Unassigned { field: self.field })
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }
}

/// Mutable record of one instance under test
#[derive(Debug, Clone)]
pub struct ProvisioningContext {
    spec: InstanceSpec,
    instance_id: WriteOnce<InstanceId>,
    public_address: WriteOnce<IpAddr>,
    private_address: WriteOnce<IpAddr>,
    gateway: WriteOnce<IpAddr>,
}

impl ProvisioningContext {
    pub fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            instance_id: WriteOnce::new("instance id"),
            public_address: WriteOnce::new("public address"),
            private_address: WriteOnce::new("private address"),
            gateway: WriteOnce::new("gateway"),
        }
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn sizing(&self) -> &Sizing {
        &self.spec.sizing
    }

    pub fn username(&self) -> &'static str {
        ADMIN_USERNAME
    }

    pub fn password(&self) -> &str {
        &self.spec.password
    }

    pub fn instance_id(&self) -> &WriteOnce<InstanceId> {
        &self.instance_id
    }

    pub fn set_instance_id(&mut self, id: InstanceId) -> Result<()> {
        self.instance_id.set(id)
    }

    /// Reference usable for control-plane calls; requires the instance id
    pub fn instance_ref(&self) -> Result<InstanceRef> {
        Ok(InstanceRef {
            name: self.spec.name.clone(),
            id: self.instance_id.require()?.clone(),
        })
    }

    pub fn public_address(&self) -> &WriteOnce<IpAddr> {
        &self.public_address
    }

    pub fn private_address(&self) -> &WriteOnce<IpAddr> {
        &self.private_address
    }

    pub fn gateway(&self) -> &WriteOnce<IpAddr> {
        &self.gateway
    }

    /// Record whichever addresses are not assigned yet.
    ///
    /// Returns the names of the fields that were populated by this call.
    /// Addresses already assigned are left untouched; a differing value is
    /// reported back through `mismatches` so the caller can trace it.
    pub fn record_addresses(
        &mut self,
        public: Option<IpAddr>,
        private: Option<IpAddr>,
        gateway: Option<IpAddr>,
    ) -> AddressUpdate {
        let mut update = AddressUpdate::default();
        for (slot, observed) in [
            (&mut self.public_address, public),
            (&mut self.private_address, private),
            (&mut self.gateway, gateway),
        ] {
            let Some(observed) = observed else { continue };
            match slot.get().copied() {
                None => {
                    // Cannot fail: the slot was checked empty above.
                    let _ = slot.set(observed);
                    update.assigned.push(slot.field);
                }
                Some(current) if current != observed => {
                    update.mismatches.push((slot.field, current, observed));
                }
                Some(_) => {}
            }
        }
        update
    }

    /// Sizing changes after a successful reconfigure
    pub fn apply_resize(&mut self, resize: &Resize) {
        self.spec.sizing.apply(resize);
    }

    /// Serializable view with the password redacted
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            name: self.spec.name.clone(),
            os: self.spec.os.clone(),
            instance_id: self.instance_id.get().cloned(),
            sizing: self.spec.sizing.clone(),
            public_address: self.public_address.get().copied(),
            private_address: self.private_address.get().copied(),
            gateway: self.gateway.get().copied(),
            username: ADMIN_USERNAME.to_string(),
        }
    }
}

/// Outcome of [`ProvisioningContext::record_addresses`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressUpdate {
    pub assigned: Vec<&'static str>,
    pub mismatches: Vec<(&'static str, IpAddr, IpAddr)>,
}

/// Password-free copy of a context for result files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub name: String,
    pub os: String,
    pub instance_id: Option<InstanceId>,
    pub sizing: Sizing,
    pub public_address: Option<IpAddr>,
    pub private_address: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub username: String,
}

impl ContextSnapshot {
    pub fn instance_ref(&self) -> Option<InstanceRef> {
        self.instance_id.clone().map(|id| InstanceRef {
            name: self.name.clone(),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskKind, DiskSpec};

    fn context() -> ProvisioningContext {
        ProvisioningContext::new(InstanceSpec {
            name: "TEST_VM_01".to_string(),
            os: "CentOS 6 x64".to_string(),
            hostname: Some("tes-vm-01".to_string()),
            password: "secret".to_string(),
            software: vec![],
            use_recommended: false,
            sizing: Sizing {
                vcpus: 8,
                ram_mib: 8192,
                disk: DiskSpec {
                    kind: DiskKind::UltrafastSsd,
                    size_gib: 100,
                },
                bandwidth_mbps: Some(50),
            },
            public_ipv4: true,
            firewall: vec![],
        })
    }

    #[test]
    fn test_instance_id_is_write_once() {
        let mut ctx = context();
        assert!(ctx.instance_ref().is_err());

        ctx.set_instance_id(InstanceId::new("4711")).unwrap();
        let err = ctx.set_instance_id(InstanceId::new("4712")).unwrap_err();
        assert!(matches!(err, Error::AlreadyAssigned { field: "instance id", .. }));
        assert_eq!(ctx.instance_ref().unwrap().id.as_str(), "4711");
    }

    #[test]
    fn test_record_addresses_never_overwrites() {
        let mut ctx = context();
        let public: IpAddr = "203.0.113.10".parse().unwrap();
        let private: IpAddr = "10.0.0.5".parse().unwrap();

        let first = ctx.record_addresses(Some(public), None, None);
        assert_eq!(first.assigned, vec!["public address"]);

        let other: IpAddr = "203.0.113.99".parse().unwrap();
        let second = ctx.record_addresses(Some(other), Some(private), None);
        assert_eq!(second.assigned, vec!["private address"]);
        assert_eq!(second.mismatches, vec![("public address", public, other)]);
        assert_eq!(ctx.public_address().get(), Some(&public));
        assert!(!ctx.gateway().is_set());
    }

    #[test]
    fn test_snapshot_redacts_password() {
        let ctx = context();
        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"username\":\"root\""));
    }
}
