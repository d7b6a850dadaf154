//! Pipeline orchestration
//!
//! One [`ProvisioningContext`] and one [`Lifecycle`] per pipeline, passed by
//! reference into each stage function. A failing stage aborts its pipeline;
//! nothing already created is rolled back.

use chrono::{DateTime, Utc};
use panelprobe_common::{
    ContextSnapshot, DisplayedInstance, DisplayedStatus, InstanceRef, PowerState,
    ProvisioningContext, Resize,
};
use panelprobe_remote::SessionFactory;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlane;
use crate::error::{E2eError, E2eResult};
use crate::expect::render_template;
use crate::guest::{self, CheckOutcome, GuestTarget, RenderedCheck};
use crate::poll::{poll_until, Observation, PollPolicy};
use crate::probe::ReachabilityProbe;
use crate::spec::{CheckSpec, PipelineSpec, SessionMode, StageAction, StageSpec};
use crate::stage::{check_preconditions, InstanceState, Lifecycle, StageKind};

/// Result of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub action: StageKind,
    pub success: bool,
    pub duration_ms: u64,
    /// Lifecycle state once the stage returned
    pub state: InstanceState,
    pub checks: Vec<CheckOutcome>,
    pub error: Option<String>,
}

/// Result of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub name: String,
    pub success: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub stages: Vec<StageResult>,
    pub error: Option<String>,
    pub final_state: InstanceState,
    pub states: Vec<InstanceState>,
    pub context: ContextSnapshot,
}

impl PipelineResult {
    fn skipped(spec: &PipelineSpec) -> Self {
        Self {
            name: spec.name.clone(),
            success: false,
            skipped: true,
            duration_ms: 0,
            stages: vec![],
            error: None,
            final_state: InstanceState::Unconfigured,
            states: vec![InstanceState::Unconfigured],
            context: ProvisioningContext::new(spec.instance.clone()).snapshot(),
        }
    }
}

/// Result of running all pipelines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub results: Vec<PipelineResult>,
}

impl SuiteResult {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bound and interval for every control-plane state wait
    pub waits: PollPolicy,

    /// Delay before the single retry of a failed reachability probe
    pub reachability_retry_delay: Duration,

    /// Run independent pipelines concurrently
    pub parallel: bool,

    /// Keep running later pipelines after one failed (sequential mode)
    pub keep_going: bool,

    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            waits: PollPolicy::default(),
            reachability_retry_delay: Duration::from_secs(10),
            parallel: false,
            keep_going: false,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

/// Sequences pipeline stages against a control plane and the guests it creates
pub struct Orchestrator {
    control_plane: Arc<dyn ControlPlane>,
    sessions: SessionFactory,
    probe: Arc<dyn ReachabilityProbe>,
    config: RunnerConfig,
}

impl Orchestrator {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        sessions: SessionFactory,
        probe: Arc<dyn ReachabilityProbe>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            control_plane,
            sessions,
            probe,
            config,
        }
    }

    /// Run every pipeline.
    ///
    /// Sequentially by default, stopping at the first failed pipeline unless
    /// `keep_going` is set; the rest are reported as skipped. With `parallel`
    /// all pipelines run concurrently, each with its own context.
    pub async fn run_suite(&self, specs: &[PipelineSpec]) -> SuiteResult {
        let started_at = Utc::now();
        let start = Instant::now();

        info!("Running {} pipeline(s)...", specs.len());

        let results = if self.config.parallel {
            futures::future::join_all(specs.iter().map(|spec| self.run_pipeline(spec))).await
        } else {
            let mut results = Vec::with_capacity(specs.len());
            let mut halted = false;
            for spec in specs {
                if halted {
                    results.push(PipelineResult::skipped(spec));
                    continue;
                }
                let result = self.run_pipeline(spec).await;
                if !result.success && !self.config.keep_going {
                    halted = true;
                }
                results.push(result);
            }
            results
        };

        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for result in &results {
            if result.skipped {
                skipped += 1;
                warn!("- {} skipped", result.name);
            } else if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!(
            "Pipeline Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        SuiteResult {
            total: specs.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            started_at,
            results,
        }
    }

    /// Run one pipeline with a fresh context, stopping at the first failed stage
    pub async fn run_pipeline(&self, spec: &PipelineSpec) -> PipelineResult {
        let start = Instant::now();
        info!("Running pipeline {} ({} stages)", spec.name, spec.stages.len());

        let mut ctx = ProvisioningContext::new(spec.instance.clone());
        let mut lifecycle = Lifecycle::new();
        let mut stages = Vec::with_capacity(spec.stages.len());
        let mut failure = None;

        for stage in &spec.stages {
            let result = self.run_stage(stage, &mut ctx, &mut lifecycle).await;
            let error = result.error.clone();
            stages.push(result);
            if let Some(e) = error {
                lifecycle.abort();
                failure = Some(e);
                break;
            }
        }

        if failure.is_none() {
            if let Err(e) = lifecycle.finish() {
                lifecycle.abort();
                failure = Some(e.to_string());
            }
        }

        PipelineResult {
            name: spec.name.clone(),
            success: failure.is_none(),
            skipped: false,
            duration_ms: start.elapsed().as_millis() as u64,
            stages,
            error: failure,
            final_state: lifecycle.state(),
            states: lifecycle.history().to_vec(),
            context: ctx.snapshot(),
        }
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        ctx: &mut ProvisioningContext,
        lifecycle: &mut Lifecycle,
    ) -> StageResult {
        let label = stage.label();
        let kind = stage.action.kind();
        let start = Instant::now();
        let mut checks = Vec::new();

        info!("[{}] {} {}", ctx.name(), kind, label);

        let outcome = match &stage.action {
            StageAction::Create => self.create(&label, ctx, lifecycle).await,
            StageAction::Start => self.start(&label, ctx, lifecycle).await,
            StageAction::Stop => self.stop(&label, ctx, lifecycle).await,
            StageAction::Reconfigure { resize } => self.reconfigure(&label, ctx, lifecycle, resize).await,
            StageAction::Verify { session, checks: specs } => {
                self.verify(&label, ctx, lifecycle, *session, specs, &mut checks).await
            }
        };

        let error = match outcome {
            Ok(()) => None,
            Err(e) => {
                error!("[{}] {} failed: {}", ctx.name(), label, e);
                Some(e.to_string())
            }
        };

        StageResult {
            name: label,
            action: kind,
            success: error.is_none(),
            duration_ms: start.elapsed().as_millis() as u64,
            state: lifecycle.state(),
            checks,
            error,
        }
    }

    /// Submit the create form, wait for the instance to show as off and
    /// record its id
    pub async fn create(
        &self,
        stage: &str,
        ctx: &mut ProvisioningContext,
        lifecycle: &mut Lifecycle,
    ) -> E2eResult<()> {
        check_preconditions(stage, StageKind::Create, ctx, lifecycle)?;
        lifecycle.transition(InstanceState::Creating)?;

        self.control_plane.create_instance(ctx.spec()).await?;
        let row = self
            .wait_for_row(ctx.name(), "displayed as off with an id", |row| {
                row.status == DisplayedStatus::Off && row.id.is_some()
            })
            .await?;

        let id = row
            .id
            .ok_or_else(|| E2eError::ControlPlane(format!("no id displayed for '{}'", ctx.name())))?;
        info!("\t...created, id {}", id);
        ctx.set_instance_id(id)?;
        lifecycle.transition(InstanceState::Off)
    }

    /// Power on, wait for the instance to show as on with its public and
    /// private addresses and gateway, and record them
    pub async fn start(
        &self,
        stage: &str,
        ctx: &mut ProvisioningContext,
        lifecycle: &mut Lifecycle,
    ) -> E2eResult<()> {
        check_preconditions(stage, StageKind::Start, ctx, lifecycle)?;
        let instance = ctx.instance_ref()?;
        lifecycle.transition(InstanceState::Starting)?;

        self.control_plane.set_power_state(&instance, PowerState::On).await?;
        // The detail view can lag the list, so every address is polled for
        let row = self
            .wait_for_row(&instance.name, "displayed as on with all addresses", |row| {
                row.status == DisplayedStatus::On
                    && row.public_address.is_some()
                    && row.private_address.is_some()
                    && row.gateway.is_some()
            })
            .await?;

        let update = ctx.record_addresses(row.public_address, row.private_address, row.gateway);
        if let Some((field, recorded, observed)) = update.mismatches.first() {
            return Err(E2eError::AssertionFailed {
                check: format!("{} of '{}' unchanged", field, instance.name),
                expected: recorded.to_string(),
                observed: observed.to_string(),
            });
        }
        for field in &update.assigned {
            debug!("Recorded {} for '{}'", field, instance.name);
        }
        info!(
            "\t...started, public ip {}",
            row.public_address.map(|a| a.to_string()).unwrap_or_default()
        );
        lifecycle.transition(InstanceState::Running)
    }

    /// Power off and wait for the instance to show as off
    pub async fn stop(
        &self,
        stage: &str,
        ctx: &ProvisioningContext,
        lifecycle: &mut Lifecycle,
    ) -> E2eResult<()> {
        check_preconditions(stage, StageKind::Stop, ctx, lifecycle)?;
        let instance = ctx.instance_ref()?;
        self.power_off(&instance, lifecycle).await
    }

    /// Submit new sizing and wait for the rebuild to finish. A running
    /// instance is powered off first.
    pub async fn reconfigure(
        &self,
        stage: &str,
        ctx: &mut ProvisioningContext,
        lifecycle: &mut Lifecycle,
        resize: &Resize,
    ) -> E2eResult<()> {
        check_preconditions(stage, StageKind::Reconfigure, ctx, lifecycle)?;
        let instance = ctx.instance_ref()?;

        if lifecycle.state() == InstanceState::Running {
            info!("Stopping '{}' before reconfigure", instance.name);
            self.power_off(&instance, lifecycle).await?;
        }

        lifecycle.transition(InstanceState::Reconfiguring)?;
        self.control_plane.reconfigure(&instance, resize).await?;
        self.wait_for_row(&instance.name, "displayed as off after reconfigure", |row| {
            row.status == DisplayedStatus::Off
        })
        .await?;

        ctx.apply_resize(resize);
        info!("\t...reconfigured ({})", resize);
        lifecycle.transition(InstanceState::Off)
    }

    /// Run checks in the guest.
    ///
    /// The first verify of a pipeline runs the reachability pre-check. Every
    /// check that ran is appended to `outcomes`, also when the stage fails.
    pub async fn verify(
        &self,
        stage: &str,
        ctx: &ProvisioningContext,
        lifecycle: &mut Lifecycle,
        mode: SessionMode,
        checks: &[CheckSpec],
        outcomes: &mut Vec<CheckOutcome>,
    ) -> E2eResult<()> {
        check_preconditions(stage, StageKind::Verify, ctx, lifecycle)?;
        let address = ctx.public_address().require()?.to_string();
        let rendered = render_checks(checks, ctx)?;
        lifecycle.transition(InstanceState::Verifying)?;

        if !lifecycle.guest_reachable() {
            self.ensure_reachable(&address).await?;
            lifecycle.mark_guest_reachable();
        }

        let target = GuestTarget {
            address,
            username: ctx.username().to_string(),
            password: ctx.password().to_string(),
        };
        let sessions = self.sessions.clone();
        let ran = tokio::task::spawn_blocking(move || guest::run_checks(&sessions, &target, mode, &rendered))
            .await??;
        outcomes.extend(ran);

        let failed = outcomes
            .iter()
            .find_map(|outcome| outcome.first_failure().map(|verdict| (outcome, verdict)));
        if let Some((outcome, verdict)) = failed {
            return Err(E2eError::AssertionFailed {
                check: outcome.label.clone(),
                expected: verdict.expected.clone(),
                observed: verdict.observed.clone(),
            });
        }

        lifecycle.transition(InstanceState::Running)
    }

    /// Probe `address` once; on failure wait and probe exactly once more
    pub async fn ensure_reachable(&self, address: &str) -> E2eResult<()> {
        info!("Pinging public ip: {}", address);
        if self.probe.probe(address).await? {
            info!("\t...pinging public ip OK");
            return Ok(());
        }

        warn!(
            "{} did not answer, probing again in {:?}",
            address, self.config.reachability_retry_delay
        );
        tokio::time::sleep(self.config.reachability_retry_delay).await;

        if self.probe.probe(address).await? {
            info!("\t...pinging public ip OK");
            return Ok(());
        }

        Err(E2eError::HostUnreachable {
            address: address.to_string(),
            probes: self.probe.probe_count(),
        })
    }

    /// Destroy an instance and wait until the panel no longer lists it.
    /// Never called by a pipeline on its own.
    pub async fn destroy(&self, instance: &InstanceRef) -> E2eResult<()> {
        self.control_plane.destroy_instance(instance).await?;

        let plane = &self.control_plane;
        let name = instance.name.as_str();
        let what = format!("'{}' removed from the instance list", name);
        poll_until(&what, self.config.waits, move || async move {
            Ok(match plane.read_displayed_state(name).await? {
                None => Observation::Ready(()),
                Some(row) => Observation::Pending(format!("still listed, status {}", row.status)),
            })
        })
        .await?;

        info!("\t...{} destroyed", name);
        Ok(())
    }

    /// Destroy every instance the suite created, returning the failures.
    ///
    /// A pipeline that submitted a create but never saw an id cannot be
    /// destroyed by id; it is reported as a failure so it gets removed by hand.
    pub async fn destroy_created(&self, suite: &SuiteResult) -> Vec<(String, E2eError)> {
        let mut failures = Vec::new();
        for result in &suite.results {
            match result.context.instance_ref() {
                Some(instance) => {
                    if let Err(e) = self.destroy(&instance).await {
                        error!("Destroying {} failed: {}", instance, e);
                        failures.push((instance.name.clone(), e));
                    }
                }
                None if result.states.contains(&InstanceState::Creating) => {
                    let name = result.context.name.clone();
                    let e = E2eError::ControlPlane(format!(
                        "'{}' was submitted for creation but no id was displayed, remove it by hand",
                        name
                    ));
                    warn!("{}", e);
                    failures.push((name, e));
                }
                None => {}
            }
        }
        failures
    }

    /// Write suite results to `test-results.json` in the output directory
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }

    async fn power_off(&self, instance: &InstanceRef, lifecycle: &mut Lifecycle) -> E2eResult<()> {
        lifecycle.transition(InstanceState::Stopping)?;
        self.control_plane.set_power_state(instance, PowerState::Off).await?;
        self.wait_for_row(&instance.name, "displayed as off", |row| {
            row.status == PowerState::Off.displayed()
        })
        .await?;
        info!("\t...{} stopped", instance.name);
        lifecycle.transition(InstanceState::Off)
    }

    async fn wait_for_row<P>(&self, name: &str, what: &str, ready: P) -> E2eResult<DisplayedInstance>
    where
        P: Fn(&DisplayedInstance) -> bool,
    {
        let plane = &self.control_plane;
        let ready = &ready;
        let description = format!("'{}' {}", name, what);

        poll_until(&description, self.config.waits, move || async move {
            Ok(match plane.read_displayed_state(name).await? {
                Some(row) if ready(&row) => Observation::Ready(row),
                Some(row) => Observation::Pending(format!("status {}", row.status)),
                None => Observation::Pending("not listed".to_string()),
            })
        })
        .await
    }
}

fn render_checks(checks: &[CheckSpec], ctx: &ProvisioningContext) -> E2eResult<Vec<RenderedCheck>> {
    checks
        .iter()
        .map(|check| {
            Ok(RenderedCheck {
                label: check.label().to_string(),
                command: render_template(&check.command, ctx)?,
                expect: check
                    .expect
                    .iter()
                    .map(|e| e.render(ctx))
                    .collect::<E2eResult<Vec<_>>>()?,
            })
        })
        .collect()
}
