//! Declarative YAML pipeline definitions
//!
//! One file describes one instance under test and the ordered stages run
//! against it. Expected values live in the file, so the same orchestration can
//! validate different panels, images and flavors.

use panelprobe_common::{InstanceSpec, Resize};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{E2eError, E2eResult};
use crate::expect::Expectation;
use crate::stage::StageKind;

const BUILTIN_FIXTURES: &[(&str, &str)] = &[
    ("ubuntu-lamp.yaml", include_str!("../fixtures/ubuntu-lamp.yaml")),
    ("centos-lamp.yaml", include_str!("../fixtures/centos-lamp.yaml")),
];

/// A complete pipeline parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Unique name for this pipeline
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering pipelines
    #[serde(default)]
    pub tags: Vec<String>,

    /// The instance this pipeline creates and verifies
    pub instance: InstanceSpec,

    /// Stages to execute in order
    pub stages: Vec<StageSpec>,
}

/// One stage of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Label used in traces and results; defaults to the action name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub action: StageAction,
}

impl StageSpec {
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.action.kind().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StageAction {
    /// Submit the create form and wait for the instance to show as off
    Create,

    /// Power on, wait for on, record the displayed addresses
    Start,

    /// Power off and wait for off
    Stop,

    /// Stop if needed, submit new sizing, wait for the rebuild to finish
    Reconfigure { resize: Resize },

    /// Run commands in the guest and assert on their results
    Verify {
        #[serde(default)]
        session: SessionMode,
        checks: Vec<CheckSpec>,
    },
}

impl StageAction {
    pub fn kind(&self) -> StageKind {
        match self {
            StageAction::Create => StageKind::Create,
            StageAction::Start => StageKind::Start,
            StageAction::Stop => StageKind::Stop,
            StageAction::Reconfigure { .. } => StageKind::Reconfigure,
            StageAction::Verify { .. } => StageKind::Verify,
        }
    }
}

/// How a verify stage talks to the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One session held across all checks of the stage
    #[default]
    Shared,
    /// A fresh session per check
    OneShot,
}

/// A command to run in the guest and what its result must satisfy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Label for traces; defaults to the command
    #[serde(default)]
    pub label: Option<String>,

    /// Command template, may contain context placeholders
    pub command: String,

    /// `- contains: x` map entries, one variant each
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub expect: Vec<Expectation>,
}

impl CheckSpec {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.command)
    }
}

impl PipelineSpec {
    /// Parse a pipeline spec from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a pipeline spec from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all pipeline specs from a directory, ordered by file name
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut specs = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            let spec = Self::from_file(entry.path())?;
            specs.push(spec);
        }

        if specs.is_empty() {
            return Err(E2eError::SpecParse(format!(
                "no pipeline specs found in {}",
                dir.display()
            )));
        }
        Ok(specs)
    }

    /// The suite compiled into the binary
    pub fn builtin() -> E2eResult<Vec<Self>> {
        BUILTIN_FIXTURES
            .iter()
            .map(|(file, yaml)| {
                Self::from_yaml(yaml).map_err(|e| E2eError::SpecParse(format!("builtin {}: {}", file, e)))
            })
            .collect()
    }

    /// Filter specs by tag
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> E2eResult<()> {
        self.instance.validate()?;
        if self.stages.is_empty() {
            return Err(E2eError::SpecParse(format!("{}: no stages", self.name)));
        }
        for stage in &self.stages {
            match &stage.action {
                StageAction::Reconfigure { resize } => resize.validate()?,
                StageAction::Verify { checks, .. } if checks.is_empty() => {
                    return Err(E2eError::SpecParse(format!(
                        "{}: verify stage '{}' has no checks",
                        self.name,
                        stage.label()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
name: smoke
tags: [smoke]
instance:
  name: smoke-vm
  os: Ubuntu 14.10 x64
  password: 'jiJ:foig@'
  sizing:
    vcpus: 2
    ram_mib: 4096
    disk:
      size_gib: 20
stages:
  - action: create
  - action: start
  - name: shrink
    action: reconfigure
    resize:
      vcpus: 1
  - action: verify
    session: one_shot
    checks:
      - command: ping -c 4 {gateway}
        expect:
          - exit_status: 0
"#;

    #[test]
    fn test_parse_minimal_spec() {
        let spec = PipelineSpec::from_yaml(MINIMAL).unwrap();
        assert_eq!(spec.stages.len(), 4);
        assert_eq!(spec.stages[2].label(), "shrink");
        match &spec.stages[2].action {
            StageAction::Reconfigure { resize } => {
                assert_eq!(resize.vcpus, Some(1));
                assert_eq!(resize.ram_mib, None);
            }
            other => panic!("unexpected stage {:?}", other),
        }
        match &spec.stages[3].action {
            StageAction::Verify { session, checks } => {
                assert_eq!(*session, SessionMode::OneShot);
                assert_eq!(checks[0].label(), "ping -c 4 {gateway}");
            }
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_builtin_suite_parses() {
        let specs = PipelineSpec::builtin().unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ubuntu-lamp", "centos-lamp"]);
        assert_eq!(PipelineSpec::filter_by_tag(&specs, "centos").len(), 1);
    }

    #[test]
    fn test_empty_reconfigure_is_rejected() {
        let yaml = MINIMAL.replace("      vcpus: 1\n", "      {}\n");
        assert!(PipelineSpec::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_load_all_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("smoke.yaml")).unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let specs = PipelineSpec::load_all(dir.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].instance.name, "smoke-vm");
    }
}
