//! Expected-value tables for in-guest checks
//!
//! Commands and expectations may reference the provisioning context with
//! `{placeholder}` syntax, e.g. `ping -c 4 {gateway}` or
//! `contains: "{private_address}"`. Rendering fails if a referenced field has
//! not been assigned yet. Literal braces are written doubled, so
//! `awk '{{print $1}}'` reaches the guest as `awk '{print $1}'`.

use panelprobe_common::ProvisioningContext;
use panelprobe_remote::CommandResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::error::{E2eError, E2eResult};

/// One assertion against a command's result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// Output contains the literal
    Contains(String),
    /// Output does not contain the literal
    NotContains(String),
    /// Exit status equals the value
    ExitStatus(i32),
    /// `/proc/cpuinfo` processor lines list index `n - 1` but not `n`
    CpuCount(u32),
}

/// Result of evaluating one expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub expected: String,
    pub observed: String,
}

impl Expectation {
    /// Substitute context placeholders in literal expectations
    pub fn render(&self, ctx: &ProvisioningContext) -> E2eResult<Self> {
        Ok(match self {
            Expectation::Contains(s) => Expectation::Contains(render_template(s, ctx)?),
            Expectation::NotContains(s) => Expectation::NotContains(render_template(s, ctx)?),
            other => other.clone(),
        })
    }

    pub fn evaluate(&self, result: &CommandResult) -> Verdict {
        match self {
            Expectation::Contains(literal) => Verdict {
                passed: result.stdout.contains(literal.as_str()),
                expected: format!("output containing {:?}", literal),
                observed: format!("{:?}", result.stdout.trim_end()),
            },
            Expectation::NotContains(literal) => Verdict {
                passed: !result.stdout.contains(literal.as_str()),
                expected: format!("output without {:?}", literal),
                observed: format!("{:?}", result.stdout.trim_end()),
            },
            Expectation::ExitStatus(status) => Verdict {
                passed: result.status == *status,
                expected: format!("exit status {}", status),
                observed: format!("exit status {}", result.status),
            },
            Expectation::CpuCount(count) => {
                let indices = processor_indices(&result.stdout);
                let highest = count.saturating_sub(1);
                Verdict {
                    passed: *count > 0 && indices.contains(&highest) && !indices.contains(count),
                    expected: format!("processor index {} present and {} absent", highest, count),
                    observed: format!("processor indices {:?}", indices),
                }
            }
        }
    }
}

fn processor_indices(cpuinfo: &str) -> BTreeSet<u32> {
    static PROCESSOR: OnceLock<Regex> = OnceLock::new();
    let re = PROCESSOR.get_or_init(|| Regex::new(r"(?m)^processor\s*:\s*(\d+)").unwrap());
    re.captures_iter(cpuinfo)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Replace `{field}` placeholders with values from the context; `{{` and
/// `}}` stand for literal braces
pub fn render_template(template: &str, ctx: &ProvisioningContext) -> E2eResult<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{|\}\}|\{([a-z_]+)\}").unwrap());

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        rendered.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            Some(field) => rendered.push_str(&lookup(field.as_str(), ctx)?),
            None => rendered.push_str(&whole.as_str()[..1]),
        }
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

fn lookup(field: &str, ctx: &ProvisioningContext) -> E2eResult<String> {
    let value = match field {
        "name" => ctx.name().to_string(),
        "hostname" => ctx.spec().hostname.clone().unwrap_or_else(|| ctx.name().to_string()),
        "os" => ctx.spec().os.clone(),
        "username" => ctx.username().to_string(),
        "instance_id" => ctx.instance_id().require()?.to_string(),
        "public_address" => ctx.public_address().require()?.to_string(),
        "private_address" => ctx.private_address().require()?.to_string(),
        "gateway" => ctx.gateway().require()?.to_string(),
        "vcpus" => ctx.sizing().vcpus.to_string(),
        "ram_mib" => ctx.sizing().ram_mib.to_string(),
        "disk_size_gib" => ctx.sizing().disk.size_gib.to_string(),
        unknown => {
            return Err(E2eError::SpecParse(format!("unknown placeholder {{{}}}", unknown)));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelprobe_common::{DiskKind, DiskSpec, InstanceSpec, Sizing};
    use test_case::test_case;

    fn ctx() -> ProvisioningContext {
        ProvisioningContext::new(InstanceSpec {
            name: "Ubuntu-1410".to_string(),
            os: "Ubuntu 14.10 x64".to_string(),
            hostname: None,
            password: "pw".to_string(),
            software: vec![],
            use_recommended: false,
            sizing: Sizing {
                vcpus: 8,
                ram_mib: 16384,
                disk: DiskSpec {
                    kind: DiskKind::UltrafastSsd,
                    size_gib: 100,
                },
                bandwidth_mbps: None,
            },
            public_ipv4: true,
            firewall: vec![],
        })
    }

    fn output(stdout: &str, status: i32) -> CommandResult {
        CommandResult {
            stdout: stdout.to_string(),
            status,
        }
    }

    #[test]
    fn test_render_uses_assigned_fields() {
        let mut ctx = ctx();
        ctx.record_addresses(None, None, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(
            render_template("ping -c 4 {gateway} # {hostname}", &ctx).unwrap(),
            "ping -c 4 10.0.0.1 # Ubuntu-1410"
        );
    }

    #[test]
    fn test_render_unassigned_field_fails() {
        let err = render_template("ifconfig | grep {private_address}", &ctx()).unwrap_err();
        assert!(matches!(err, E2eError::Context(_)));
    }

    #[test]
    fn test_render_doubled_braces_are_literal() {
        let mut ctx = ctx();
        ctx.record_addresses(None, None, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(
            render_template("ip route | awk '{{print}}' | grep {gateway}", &ctx).unwrap(),
            "ip route | awk '{print}' | grep 10.0.0.1"
        );
        assert_eq!(
            render_template("awk '{{print $1}}'", &ctx).unwrap(),
            "awk '{print $1}'"
        );
    }

    #[test]
    fn test_render_unknown_placeholder_fails() {
        let err = render_template("{password}", &ctx()).unwrap_err();
        assert!(matches!(err, E2eError::SpecParse(_)));
    }

    const EIGHT_CPUS: &str = "processor\t: 0\nprocessor\t: 1\nprocessor\t: 2\nprocessor\t: 3\n\
processor\t: 4\nprocessor\t: 5\nprocessor\t: 6\nprocessor\t: 7\n";

    #[test_case(8, true ; "exact count")]
    #[test_case(2, false ; "more processors than expected")]
    #[test_case(16, false ; "fewer processors than expected")]
    fn test_cpu_count(count: u32, passed: bool) {
        let verdict = Expectation::CpuCount(count).evaluate(&output(EIGHT_CPUS, 0));
        assert_eq!(verdict.passed, passed, "{:?}", verdict);
    }

    #[test]
    fn test_contains_reports_literal_values() {
        let verdict = Expectation::Contains("16433320".to_string())
            .evaluate(&output("MemTotal:        4047756 kB\n", 0));
        assert!(!verdict.passed);
        assert!(verdict.expected.contains("16433320"));
        assert!(verdict.observed.contains("4047756"));
    }

    #[test]
    fn test_exit_status() {
        assert!(Expectation::ExitStatus(0).evaluate(&output("", 0)).passed);
        assert!(!Expectation::ExitStatus(0).evaluate(&output("", 1)).passed);
        assert!(Expectation::NotContains("8".to_string()).evaluate(&output("7", 0)).passed);
    }

    #[test]
    fn test_parse_expectations_yaml() {
        let yaml = r#"
command: cat /proc/cpuinfo | grep processor
expect:
  - contains: processor
  - not_contains: "processor\t: 8"
  - exit_status: 0
  - cpu_count: 8
"#;
        let check: crate::spec::CheckSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            check.expect,
            vec![
                Expectation::Contains("processor".to_string()),
                Expectation::NotContains("processor\t: 8".to_string()),
                Expectation::ExitStatus(0),
                Expectation::CpuCount(8),
            ]
        );
        assert!(check.expect.iter().all(|e| e.evaluate(&output(EIGHT_CPUS, 0)).passed));
    }
}
