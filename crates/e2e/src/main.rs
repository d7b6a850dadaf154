//! PanelProbe
//!
//! Runs the pipeline suite against a provisioning panel.

use anyhow::Context;
use clap::Parser;
use panelprobe_e2e::{
    wait_for_panel, Browser, Orchestrator, PingProbe, PipelineSpec, PlaywrightControlPlane,
    RunnerConfig, SuiteConfig,
};
use panelprobe_remote::{SessionFactory, Ssh2Connector};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "panelprobe")]
#[command(about = "End-to-end validation of a VM provisioning panel")]
#[command(version)]
struct Cli {
    /// Operator email for the panel
    email: String,

    /// Operator password for the panel
    password: String,

    /// Panel base URL
    base_url: String,

    /// Directory of pipeline YAML files (built-in suite when omitted)
    #[arg(short, long)]
    fixtures: Option<PathBuf>,

    /// Only run pipelines with this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Only run the pipeline with this name
    #[arg(short, long)]
    name: Option<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "panelprobe.toml")]
    config: PathBuf,

    /// Directory for test-results.json
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,

    /// Browser to drive (chromium, firefox, webkit)
    #[arg(long)]
    browser: Option<Browser>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Run independent pipelines concurrently
    #[arg(long)]
    parallel: bool,

    /// Keep running later pipelines after a failure
    #[arg(long)]
    keep_going: bool,

    /// Destroy every created instance after the suite
    #[arg(long)]
    destroy: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("PanelProbe v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = SuiteConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(browser) = cli.browser {
        config.panel.browser = browser;
    }
    if cli.headed {
        config.panel.headless = false;
    }

    let specs = select_specs(&cli)?;
    info!("Selected {} pipeline(s)", specs.len());

    wait_for_panel(
        &cli.base_url,
        Duration::from_secs(config.panel.startup_timeout_secs),
    )
    .await?;

    let control_plane =
        PlaywrightControlPlane::connect(&cli.base_url, &cli.email, &cli.password, config.panel.clone())
            .await?;

    let connector = Ssh2Connector::new(config.session.port, config.connect_timeout());
    let sessions = SessionFactory::new(Arc::new(connector), config.retry_policy(), config.command_timeout());

    let orchestrator = Orchestrator::new(
        Arc::new(control_plane),
        sessions,
        Arc::new(PingProbe::new(config.reachability.probe_count)),
        RunnerConfig {
            waits: config.poll_policy(),
            reachability_retry_delay: config.reachability_retry_delay(),
            parallel: cli.parallel,
            keep_going: cli.keep_going,
            output_dir: cli.output.clone(),
        },
    );

    let suite = orchestrator.run_suite(&specs).await;
    orchestrator.write_results(&suite)?;

    let mut ok = suite.all_passed();
    if cli.destroy {
        let failures = orchestrator.destroy_created(&suite).await;
        if !failures.is_empty() {
            error!("{} instance(s) could not be destroyed", failures.len());
            ok = false;
        }
    }

    Ok(ok)
}

fn select_specs(cli: &Cli) -> anyhow::Result<Vec<PipelineSpec>> {
    let mut specs = match &cli.fixtures {
        Some(dir) => PipelineSpec::load_all(dir)?,
        None => PipelineSpec::builtin()?,
    };

    if let Some(tag) = &cli.tag {
        specs = PipelineSpec::filter_by_tag(&specs, tag).into_iter().cloned().collect();
    }
    if let Some(name) = &cli.name {
        specs.retain(|s| &s.name == name);
    }
    if specs.is_empty() {
        anyhow::bail!("no pipelines match the selection");
    }
    Ok(specs)
}
