//! In-guest verification over SSH
//!
//! Blocking: the orchestrator runs [`run_checks`] on tokio's blocking pool.

use panelprobe_remote::{CommandResult, RemoteError, RemoteSession, SessionFactory};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::E2eResult;
use crate::expect::{Expectation, Verdict};
use crate::spec::SessionMode;

/// Where and as whom to run checks
#[derive(Clone)]
pub struct GuestTarget {
    pub address: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for GuestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestTarget")
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A check with all placeholders substituted
#[derive(Debug, Clone)]
pub struct RenderedCheck {
    pub label: String,
    pub command: String,
    pub expect: Vec<Expectation>,
}

/// What one check observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub label: String,
    pub command: String,
    pub status: i32,
    pub output: String,
    pub verdicts: Vec<Verdict>,
    pub passed: bool,
}

impl CheckOutcome {
    fn evaluate(check: &RenderedCheck, result: CommandResult) -> Self {
        let verdicts: Vec<Verdict> = check.expect.iter().map(|e| e.evaluate(&result)).collect();
        let passed = verdicts.iter().all(|v| v.passed);
        Self {
            label: check.label.clone(),
            command: check.command.clone(),
            status: result.status,
            output: result.stdout,
            verdicts,
            passed,
        }
    }

    /// First verdict that did not hold
    pub fn first_failure(&self) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| !v.passed)
    }
}

/// Run `checks` in order, stopping after the first one that fails.
///
/// In [`SessionMode::Shared`] one session serves all checks and is closed
/// before returning, whatever the outcome. In [`SessionMode::OneShot`] every
/// check gets its own session.
pub fn run_checks(
    sessions: &SessionFactory,
    target: &GuestTarget,
    mode: SessionMode,
    checks: &[RenderedCheck],
) -> E2eResult<Vec<CheckOutcome>> {
    match mode {
        SessionMode::Shared => {
            let mut session = sessions
                .acquire(&target.address, &target.username, &target.password)?
                .ok_or_else(|| RemoteError::RetriesExhausted {
                    address: target.address.clone(),
                    attempts: sessions.policy().retries.max(1),
                })?;

            let outcomes = run_in_session(&mut session, checks);
            if let Err(e) = session.close() {
                warn!("Closing session to {} failed: {}", target.address, e);
            }
            outcomes
        }
        SessionMode::OneShot => {
            let mut outcomes = Vec::with_capacity(checks.len());
            for check in checks {
                trace_command(check);
                let result = sessions.run_once(
                    &target.address,
                    &target.username,
                    &target.password,
                    &check.command,
                )?;
                let outcome = record(check, result);
                let passed = outcome.passed;
                outcomes.push(outcome);
                if !passed {
                    break;
                }
            }
            Ok(outcomes)
        }
    }
}

fn run_in_session(session: &mut RemoteSession, checks: &[RenderedCheck]) -> E2eResult<Vec<CheckOutcome>> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        trace_command(check);
        let result = session.execute(&check.command)?;
        let outcome = record(check, result);
        let passed = outcome.passed;
        outcomes.push(outcome);
        if !passed {
            break;
        }
    }
    Ok(outcomes)
}

fn trace_command(check: &RenderedCheck) {
    info!("{}: $ {}", check.label, check.command);
}

fn record(check: &RenderedCheck, result: CommandResult) -> CheckOutcome {
    for line in result.lines() {
        info!("\t{}", line);
    }
    let outcome = CheckOutcome::evaluate(check, result);
    match outcome.first_failure() {
        None => info!("\t...{} OK (exit status {})", check.label, outcome.status),
        Some(verdict) => error!(
            "\t...{} FAILED: expected {}, observed {}",
            check.label, verdict.expected, verdict.observed
        ),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelprobe_remote::{Connector, ExecStream, Link, RemoteResult, RetryPolicy, StreamEvent};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers commands from a table, counting connections and disconnects
    #[derive(Default)]
    struct TableConnector {
        answers: HashMap<String, (String, i32)>,
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        unreachable: bool,
    }

    struct TableLink {
        answers: HashMap<String, (String, i32)>,
        disconnects: Arc<AtomicUsize>,
    }

    struct Answer {
        events: Vec<StreamEvent>,
    }

    impl ExecStream for Answer {
        fn next_event(&mut self) -> RemoteResult<StreamEvent> {
            Ok(if self.events.is_empty() {
                StreamEvent::Exited(Some(0))
            } else {
                self.events.remove(0)
            })
        }
    }

    impl Link for TableLink {
        fn exec(&mut self, command: &str) -> RemoteResult<Box<dyn ExecStream + '_>> {
            let (stdout, status) = self
                .answers
                .get(command)
                .cloned()
                .unwrap_or_else(|| (String::new(), 127));
            Ok(Box::new(Answer {
                events: vec![StreamEvent::Output(stdout.into_bytes()), StreamEvent::Exited(Some(status))],
            }))
        }

        fn disconnect(&mut self) -> RemoteResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Connector for TableConnector {
        fn connect(&self, address: &str, _username: &str, _password: &str) -> RemoteResult<Box<dyn Link>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(RemoteError::Unreachable {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(TableLink {
                answers: self.answers.clone(),
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    fn connector(answers: &[(&str, &str, i32)]) -> TableConnector {
        TableConnector {
            answers: answers
                .iter()
                .map(|(c, o, s)| (c.to_string(), (o.to_string(), *s)))
                .collect(),
            ..Default::default()
        }
    }

    fn factory(connector: TableConnector) -> SessionFactory {
        SessionFactory::new(
            Arc::new(connector),
            RetryPolicy {
                retries: 3,
                interval: Duration::ZERO,
            },
            Duration::from_secs(5),
        )
    }

    fn target() -> GuestTarget {
        GuestTarget {
            address: "203.0.113.10".to_string(),
            username: "root".to_string(),
            password: "pw".to_string(),
        }
    }

    fn check(command: &str, expect: Expectation) -> RenderedCheck {
        RenderedCheck {
            label: command.to_string(),
            command: command.to_string(),
            expect: vec![expect],
        }
    }

    #[test]
    fn test_shared_session_stops_at_first_failure_and_closes() {
        let conn = connector(&[
            ("apt list --installed | grep apache2", "apache2/utopic 2.4.10\n", 0),
            ("apt list --installed | grep mysql-server", "", 1),
        ]);
        let connects = conn.connects.clone();
        let disconnects = conn.disconnects.clone();

        let checks = vec![
            check("apt list --installed | grep apache2", Expectation::Contains("apache2".into())),
            check("apt list --installed | grep mysql-server", Expectation::Contains("mysql-server".into())),
            check("never run", Expectation::ExitStatus(0)),
        ];
        let outcomes = run_checks(&factory(conn), &target(), SessionMode::Shared, &checks).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert_eq!(outcomes[1].status, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_shot_opens_a_session_per_check() {
        let conn = connector(&[
            ("yum -y install iperf.x86_64", "Installed: iperf\nComplete!\n", 0),
            ("rpm -qa | grep iperf", "iperf-2.0.5-11.el6.x86_64\n", 0),
        ]);
        let connects = conn.connects.clone();
        let disconnects = conn.disconnects.clone();

        let checks = vec![
            check("yum -y install iperf.x86_64", Expectation::Contains("Complete".into())),
            check("rpm -qa | grep iperf", Expectation::Contains("iperf".into())),
        ];
        let outcomes = run_checks(&factory(conn), &target(), SessionMode::OneShot, &checks).unwrap();

        assert!(outcomes.iter().all(|o| o.passed));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unreachable_guest_reports_exhausted_retries() {
        let conn = TableConnector {
            unreachable: true,
            ..Default::default()
        };
        let connects = conn.connects.clone();
        let checks = vec![check("ifconfig", Expectation::ExitStatus(0))];

        let err = run_checks(&factory(conn), &target(), SessionMode::Shared, &checks).unwrap_err();
        assert_eq!(err.to_string(), "Remote error: SSH connection refused after 3 retries");
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }
}
