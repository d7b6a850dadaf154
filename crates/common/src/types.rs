//! Core types for PanelProbe

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Opaque identifier the control plane assigns to an instance after creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an existing instance: the display name plus the assigned id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub name: String,
    pub id: InstanceId,
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Primary disk type offered by the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Hdd,
    Ssd,
    UltrafastSsd,
}

impl DiskKind {
    /// Label shown in the panel's disk type dropdown
    pub fn label(&self) -> &'static str {
        match self {
            DiskKind::Hdd => "HDD",
            DiskKind::Ssd => "SSD",
            DiskKind::UltrafastSsd => "Ultrafast SSD",
        }
    }
}

impl Default for DiskKind {
    fn default() -> Self {
        Self::Ssd
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    #[serde(default)]
    pub kind: DiskKind,
    pub size_gib: u32,
}

/// Instance sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub vcpus: u32,
    pub ram_mib: u32,
    pub disk: DiskSpec,
    /// Bandwidth allotment in Mbit/s; panel default when unset
    #[serde(default)]
    pub bandwidth_mbps: Option<u32>,
}

impl Sizing {
    pub fn validate(&self) -> Result<()> {
        positive("vcpus", self.vcpus)?;
        positive("ram_mib", self.ram_mib)?;
        positive("disk.size_gib", self.disk.size_gib)?;
        if let Some(bandwidth) = self.bandwidth_mbps {
            positive("bandwidth_mbps", bandwidth)?;
        }
        Ok(())
    }

    /// Apply a resize on top of the current sizing
    pub fn apply(&mut self, resize: &Resize) {
        if let Some(vcpus) = resize.vcpus {
            self.vcpus = vcpus;
        }
        if let Some(ram_mib) = resize.ram_mib {
            self.ram_mib = ram_mib;
        }
        if let Some(size_gib) = resize.disk_size_gib {
            self.disk.size_gib = size_gib;
        }
        if resize.bandwidth_mbps.is_some() {
            self.bandwidth_mbps = resize.bandwidth_mbps;
        }
    }
}

/// A named panel option (software bundle or firewall template) and whether it is enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggle {
    pub name: String,
    pub enabled: bool,
}

impl FeatureToggle {
    pub fn enabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }
}

/// Everything the panel's create form takes for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Display name, also used to find the instance row in the panel
    pub name: String,

    /// Operating system label as offered by the panel
    pub os: String,

    #[serde(default)]
    pub hostname: Option<String>,

    /// Root password set at creation and reused for every later session
    pub password: String,

    /// Software bundles, in the order they are toggled
    #[serde(default)]
    pub software: Vec<FeatureToggle>,

    /// Let the panel pick sizing instead of the values below
    #[serde(default)]
    pub use_recommended: bool,

    pub sizing: Sizing,

    #[serde(default = "default_public_ipv4")]
    pub public_ipv4: bool,

    /// Firewall templates, in the order they are toggled
    #[serde(default)]
    pub firewall: Vec<FeatureToggle>,
}

fn default_public_ipv4() -> bool {
    true
}

impl InstanceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSpec("instance name is empty".to_string()));
        }
        if self.os.trim().is_empty() {
            return Err(Error::InvalidSpec(format!("{}: os is empty", self.name)));
        }
        if self.password.is_empty() {
            return Err(Error::InvalidSpec(format!("{}: password is empty", self.name)));
        }
        self.sizing
            .validate()
            .map_err(|e| Error::InvalidSpec(format!("{}: {}", self.name, e)))
    }
}

/// Sizing changes applied by a reconfigure action; unset fields stay as they are
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub ram_mib: Option<u32>,
    #[serde(default)]
    pub disk_size_gib: Option<u32>,
    #[serde(default)]
    pub bandwidth_mbps: Option<u32>,
}

impl Resize {
    pub fn is_empty(&self) -> bool {
        self.vcpus.is_none()
            && self.ram_mib.is_none()
            && self.disk_size_gib.is_none()
            && self.bandwidth_mbps.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidSpec("resize changes nothing".to_string()));
        }
        for (field, value) in [
            ("vcpus", self.vcpus),
            ("ram_mib", self.ram_mib),
            ("disk_size_gib", self.disk_size_gib),
            ("bandwidth_mbps", self.bandwidth_mbps),
        ] {
            if let Some(value) = value {
                positive(field, value)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Resize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = self.vcpus {
            parts.push(format!("vCPU={}", v));
        }
        if let Some(v) = self.ram_mib {
            parts.push(format!("RAM={}MiB", v));
        }
        if let Some(v) = self.disk_size_gib {
            parts.push(format!("disk={}GiB", v));
        }
        if let Some(v) = self.bandwidth_mbps {
            parts.push(format!("bandwidth={}Mbps", v));
        }
        f.write_str(&parts.join(" "))
    }
}

fn positive(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::InvalidSpec(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Requested power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// Displayed status that confirms this power state
    pub fn displayed(&self) -> DisplayedStatus {
        match self {
            PowerState::On => DisplayedStatus::On,
            PowerState::Off => DisplayedStatus::Off,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

/// Status text shown in the instance list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayedStatus {
    On,
    Off,
    /// Anything else the panel shows while converging (creating, rebuilding, ...)
    Other(String),
}

impl DisplayedStatus {
    /// Lowercase status texts shown for a powered-on instance
    pub const ON_TEXTS: &'static [&'static str] = &["on", "running"];

    /// Lowercase status texts shown for a powered-off instance
    pub const OFF_TEXTS: &'static [&'static str] = &["off", "stopped"];

    pub fn from_text(text: &str) -> Self {
        let normalized = text.trim().to_ascii_lowercase();
        if Self::ON_TEXTS.contains(&normalized.as_str()) {
            DisplayedStatus::On
        } else if Self::OFF_TEXTS.contains(&normalized.as_str()) {
            DisplayedStatus::Off
        } else {
            DisplayedStatus::Other(normalized)
        }
    }
}

impl std::fmt::Display for DisplayedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayedStatus::On => write!(f, "on"),
            DisplayedStatus::Off => write!(f, "off"),
            DisplayedStatus::Other(text) => write!(f, "{}", text),
        }
    }
}

/// One observation of an instance as the control plane displays it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayedInstance {
    pub name: String,
    #[serde(default)]
    pub id: Option<InstanceId>,
    pub status: DisplayedStatus,
    #[serde(default)]
    pub public_address: Option<IpAddr>,
    #[serde(default)]
    pub private_address: Option<IpAddr>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl DisplayedInstance {
    pub fn new(name: impl Into<String>, status: DisplayedStatus) -> Self {
        Self {
            name: name.into(),
            id: None,
            status,
            public_address: None,
            private_address: None,
            gateway: None,
        }
    }
}
