//! Instance lifecycle and stage preconditions
//!
//! ```text
//! Unconfigured -> Creating -> Off -> Starting -> Running <-> Verifying
//!                             | ^                   |
//!                             | +---- Stopping <----+
//!                             +-> Reconfiguring -> Off
//!
//! any non-terminal state -> Aborted
//! Off | Running          -> Done
//! ```

use panelprobe_common::ProvisioningContext;
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};

/// Where one instance under test is in its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unconfigured,
    Creating,
    Off,
    Starting,
    Running,
    Verifying,
    Reconfiguring,
    Stopping,
    Done,
    Aborted,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Done | InstanceState::Aborted)
    }

    fn can_become(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Off | Running, Done) => true,
            (Unconfigured, Creating)
            | (Creating, Off)
            | (Off, Starting)
            | (Off, Reconfiguring)
            | (Starting, Running)
            | (Running, Verifying)
            | (Running, Stopping)
            | (Verifying, Running)
            | (Stopping, Off)
            | (Reconfiguring, Off) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Unconfigured => "unconfigured",
            InstanceState::Creating => "creating",
            InstanceState::Off => "off",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Verifying => "verifying",
            InstanceState::Reconfiguring => "reconfiguring",
            InstanceState::Stopping => "stopping",
            InstanceState::Done => "done",
            InstanceState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// The five things a stage can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Create,
    Start,
    Stop,
    Reconfigure,
    Verify,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Create => "create",
            StageKind::Start => "start",
            StageKind::Stop => "stop",
            StageKind::Reconfigure => "reconfigure",
            StageKind::Verify => "verify",
        };
        write!(f, "{}", s)
    }
}

/// State machine for one pipeline, with the states it went through
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: InstanceState,
    history: Vec<InstanceState>,
    guest_reachable: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: InstanceState::Unconfigured,
            history: vec![InstanceState::Unconfigured],
            guest_reachable: false,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn history(&self) -> &[InstanceState] {
        &self.history
    }

    pub fn transition(&mut self, next: InstanceState) -> E2eResult<()> {
        if !self.state.can_become(next) {
            return Err(E2eError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Aborted` unless already terminal
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = InstanceState::Aborted;
            self.history.push(InstanceState::Aborted);
        }
    }

    pub fn finish(&mut self) -> E2eResult<()> {
        self.transition(InstanceState::Done)
    }

    /// Whether the reachability pre-check already passed for this instance
    pub fn guest_reachable(&self) -> bool {
        self.guest_reachable
    }

    pub fn mark_guest_reachable(&mut self) {
        self.guest_reachable = true;
    }
}

/// Check what a stage of `kind` needs before anything is sent to the control plane
pub fn check_preconditions(
    stage: &str,
    kind: StageKind,
    ctx: &ProvisioningContext,
    lifecycle: &Lifecycle,
) -> E2eResult<()> {
    let fail = |reason: String| E2eError::Precondition {
        stage: stage.to_string(),
        reason,
    };
    let state = lifecycle.state();
    let has_id = ctx.instance_id().is_set();

    match kind {
        StageKind::Create => {
            if has_id {
                return Err(fail(format!(
                    "instance '{}' already has id {}",
                    ctx.name(),
                    ctx.instance_id().require()?
                )));
            }
            if state != InstanceState::Unconfigured {
                return Err(fail(format!("instance is {}, expected unconfigured", state)));
            }
        }
        StageKind::Start => {
            require_id(has_id, ctx, &fail)?;
            if state != InstanceState::Off {
                return Err(fail(format!("instance is {}, expected off", state)));
            }
        }
        StageKind::Stop => {
            require_id(has_id, ctx, &fail)?;
            if state != InstanceState::Running {
                return Err(fail(format!("instance is {}, expected running", state)));
            }
        }
        StageKind::Reconfigure => {
            require_id(has_id, ctx, &fail)?;
            if !matches!(state, InstanceState::Off | InstanceState::Running) {
                return Err(fail(format!("instance is {}, expected off or running", state)));
            }
        }
        StageKind::Verify => {
            if !ctx.public_address().is_set() {
                return Err(fail(format!("no public address recorded for '{}'", ctx.name())));
            }
            if state != InstanceState::Running {
                return Err(fail(format!("instance is {}, expected running", state)));
            }
        }
    }
    Ok(())
}

fn require_id(
    has_id: bool,
    ctx: &ProvisioningContext,
    fail: &impl Fn(String) -> E2eError,
) -> E2eResult<()> {
    if has_id {
        Ok(())
    } else {
        Err(fail(format!("no instance id recorded for '{}'", ctx.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelprobe_common::{DiskSpec, InstanceId, InstanceSpec, Sizing};
    use test_case::test_case;

    fn ctx() -> ProvisioningContext {
        ProvisioningContext::new(InstanceSpec {
            name: "TEST_VM_01".to_string(),
            os: "CentOS 6 x64".to_string(),
            hostname: None,
            password: "pw".to_string(),
            software: vec![],
            use_recommended: false,
            sizing: Sizing {
                vcpus: 8,
                ram_mib: 8192,
                disk: DiskSpec {
                    kind: Default::default(),
                    size_gib: 100,
                },
                bandwidth_mbps: None,
            },
            public_ipv4: true,
            firewall: vec![],
        })
    }

    fn lifecycle_at(states: &[InstanceState]) -> Lifecycle {
        let mut lifecycle = Lifecycle::new();
        for state in states {
            lifecycle.transition(*state).unwrap();
        }
        lifecycle
    }

    #[test]
    fn test_full_walk_is_valid() {
        use InstanceState::*;
        let lifecycle = lifecycle_at(&[
            Creating, Off, Starting, Running, Verifying, Running, Stopping, Off, Reconfiguring,
            Off, Starting, Running, Verifying, Running, Done,
        ]);
        assert_eq!(lifecycle.state(), Done);
        assert_eq!(lifecycle.history().len(), 16);
    }

    #[test_case(&[], InstanceState::Starting ; "start before create")]
    #[test_case(&[InstanceState::Creating, InstanceState::Off], InstanceState::Verifying ; "verify while off")]
    #[test_case(&[InstanceState::Creating, InstanceState::Off, InstanceState::Done], InstanceState::Aborted ; "abort after done")]
    fn test_invalid_transitions(path: &[InstanceState], to: InstanceState) {
        let mut lifecycle = lifecycle_at(path);
        assert!(matches!(
            lifecycle.transition(to),
            Err(E2eError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_abort_is_sticky() {
        let mut lifecycle = lifecycle_at(&[InstanceState::Creating]);
        lifecycle.abort();
        lifecycle.abort();
        assert_eq!(lifecycle.state(), InstanceState::Aborted);
        assert_eq!(lifecycle.history().last(), Some(&InstanceState::Aborted));
        assert_eq!(lifecycle.history().len(), 3);
    }

    #[test]
    fn test_reconfigure_without_id_is_rejected() {
        let lifecycle = lifecycle_at(&[InstanceState::Creating, InstanceState::Off]);
        let err = check_preconditions("shrink", StageKind::Reconfigure, &ctx(), &lifecycle).unwrap_err();
        match err {
            E2eError::Precondition { stage, reason } => {
                assert_eq!(stage, "shrink");
                assert!(reason.contains("instance id"), "{}", reason);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let mut ctx = ctx();
        ctx.set_instance_id(InstanceId::new("4711")).unwrap();
        let err = check_preconditions("create", StageKind::Create, &ctx, &Lifecycle::new());
        assert!(matches!(err, Err(E2eError::Precondition { .. })));
    }

    #[test]
    fn test_verify_requires_public_address() {
        let mut ctx = ctx();
        ctx.set_instance_id(InstanceId::new("4711")).unwrap();
        let lifecycle = lifecycle_at(&[
            InstanceState::Creating,
            InstanceState::Off,
            InstanceState::Starting,
            InstanceState::Running,
        ]);
        assert!(check_preconditions("verify", StageKind::Verify, &ctx, &lifecycle).is_err());

        ctx.record_addresses(Some("203.0.113.10".parse().unwrap()), None, None);
        assert!(check_preconditions("verify", StageKind::Verify, &ctx, &lifecycle).is_ok());
    }
}
