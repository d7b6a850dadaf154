//! PanelProbe end-to-end validation
//!
//! Drives a VM provisioning panel through ordered pipeline stages and checks
//! the effect of every action inside the provisioned guest.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Orchestrator (per pipeline)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProvisioningContext + Lifecycle                            │
//! │    ├── create       -> ControlPlane, poll until off, id     │
//! │    ├── start        -> ControlPlane, poll until on, ips     │
//! │    ├── stop         -> ControlPlane, poll until off         │
//! │    ├── reconfigure  -> ControlPlane, poll until off         │
//! │    └── verify       -> ping pre-check, SessionFactory,      │
//! │                        RemoteSession::execute, expectations │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PipelineSpec (YAML)                                        │
//! │    ├── name, tags, instance                                 │
//! │    └── stages: [create | start | stop | reconfigure |       │
//! │                 verify { session, checks }]                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control_plane;
pub mod error;
pub mod expect;
pub mod guest;
pub mod panel;
pub mod playwright;
pub mod poll;
pub mod probe;
pub mod runner;
pub mod spec;
pub mod stage;

pub use config::SuiteConfig;
pub use control_plane::ControlPlane;
pub use error::{E2eError, E2eResult};
pub use expect::{Expectation, Verdict};
pub use guest::CheckOutcome;
pub use panel::wait_for_panel;
pub use playwright::{Browser, PanelConfig, PanelSelectors, PlaywrightControlPlane};
pub use poll::{poll_until, Observation, PollPolicy};
pub use probe::{PingProbe, ReachabilityProbe};
pub use runner::{Orchestrator, PipelineResult, RunnerConfig, StageResult, SuiteResult};
pub use spec::{CheckSpec, PipelineSpec, SessionMode, StageAction, StageSpec};
pub use stage::{InstanceState, Lifecycle, StageKind};
