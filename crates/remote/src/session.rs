//! Remote session - blocking command execution over one authenticated link

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::transport::{Link, StreamEvent};

/// Fully drained output of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Standard output, every chunk concatenated in arrival order
    pub stdout: String,
    /// Exit status reported by the remote process
    pub status: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// One authenticated connection to a single host.
///
/// Owned by the stage that opened it. The link is released by [`close`] or,
/// failing that, when the session is dropped.
///
/// [`close`]: RemoteSession::close
pub struct RemoteSession {
    host: String,
    principal: String,
    link: Option<Box<dyn Link>>,
    command_timeout: Duration,
}

impl RemoteSession {
    pub fn new(
        host: impl Into<String>,
        principal: impl Into<String>,
        link: Box<dyn Link>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            principal: principal.into(),
            link: Some(link),
            command_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_none()
    }

    /// Run `command` and wait for it to finish.
    ///
    /// Output is drained until the remote process signals completion; a
    /// process that has not completed by the command timeout yields
    /// [`RemoteError::CommandIncomplete`], one that completes without a status
    /// yields [`RemoteError::StatusUnavailable`].
    pub fn execute(&mut self, command: &str) -> RemoteResult<CommandResult> {
        let host = self.host.clone();
        let timeout = self.command_timeout;
        let link = self
            .link
            .as_mut()
            .ok_or(RemoteError::SessionClosed { host: host.clone() })?;

        debug!("[{}] exec: {}", host, command);
        let mut stream = link.exec(command)?;
        let deadline = Instant::now() + timeout;
        let mut stdout = Vec::new();

        loop {
            match stream.next_event()? {
                StreamEvent::Output(chunk) => stdout.extend_from_slice(&chunk),
                StreamEvent::Pending => {}
                StreamEvent::Exited(Some(status)) => {
                    return Ok(CommandResult {
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        status,
                    });
                }
                StreamEvent::Exited(None) => {
                    return Err(RemoteError::StatusUnavailable {
                        command: command.to_string(),
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(RemoteError::CommandIncomplete {
                    command: command.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Release the connection. A second call is a usage error.
    pub fn close(&mut self) -> RemoteResult<()> {
        let mut link = self.link.take().ok_or(RemoteError::SessionClosed {
            host: self.host.clone(),
        })?;
        debug!("[{}] closing session for {}", self.host, self.principal);
        link.disconnect()
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.disconnect() {
                warn!("[{}] disconnect failed: {}", self.host, e);
            }
        }
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host)
            .field("principal", &self.principal)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::ExecStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_case::test_case;

    /// Link that replays a fixed event sequence for every command
    pub(crate) struct ScriptedLink {
        pub events: Vec<StreamEvent>,
        pub disconnects: Arc<AtomicUsize>,
    }

    impl ScriptedLink {
        pub(crate) fn new(events: Vec<StreamEvent>) -> Self {
            Self {
                events,
                disconnects: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct Replay(VecDeque<StreamEvent>);

    impl ExecStream for Replay {
        fn next_event(&mut self) -> RemoteResult<StreamEvent> {
            // An exhausted script keeps reporting nothing new, like a hung process.
            Ok(self.0.pop_front().unwrap_or(StreamEvent::Pending))
        }
    }

    impl Link for ScriptedLink {
        fn exec(&mut self, _command: &str) -> RemoteResult<Box<dyn ExecStream + '_>> {
            Ok(Box::new(Replay(self.events.iter().cloned().collect())))
        }

        fn disconnect(&mut self) -> RemoteResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session(events: Vec<StreamEvent>) -> RemoteSession {
        RemoteSession::new(
            "203.0.113.10",
            "root",
            Box::new(ScriptedLink::new(events)),
            Duration::from_secs(5),
        )
    }

    fn chunked(text: &str, size: usize, status: i32) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = text
            .as_bytes()
            .chunks(size)
            .map(|c| StreamEvent::Output(c.to_vec()))
            .collect();
        events.insert(events.len() / 2, StreamEvent::Pending);
        events.push(StreamEvent::Exited(Some(status)));
        events
    }

    const MEMINFO: &str = "processor\t: 0\nprocessor\t: 1\nMemTotal:        4047756 kB\n";

    #[test_case(1 ; "byte at a time")]
    #[test_case(7 ; "odd chunks")]
    #[test_case(1024 ; "single chunk")]
    fn test_output_independent_of_chunking(size: usize) {
        let result = session(chunked(MEMINFO, size, 0)).execute("cat").unwrap();
        assert_eq!(result.stdout, MEMINFO);
        assert!(result.success());
    }

    #[test]
    fn test_output_and_nonzero_status() {
        let mut s = session(vec![
            StreamEvent::Output(b"hi\n".to_vec()),
            StreamEvent::Exited(Some(3)),
        ]);
        let result = s.execute("echo hi; exit 3").unwrap();
        assert!(result.stdout.contains("hi"));
        assert_eq!(result.status, 3);
    }

    #[test]
    fn test_empty_output_nonzero_status_is_a_result() {
        let result = session(vec![StreamEvent::Exited(Some(1))])
            .execute("grep -q nothing /dev/null")
            .unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.status, 1);
    }

    #[test]
    fn test_missing_status_is_an_error() {
        let err = session(vec![
            StreamEvent::Output(b"partial".to_vec()),
            StreamEvent::Exited(None),
        ])
        .execute("sleep 100")
        .unwrap_err();
        assert!(matches!(err, RemoteError::StatusUnavailable { .. }));
    }

    #[test]
    fn test_no_completion_hits_command_timeout() {
        let mut s = RemoteSession::new(
            "203.0.113.10",
            "root",
            Box::new(ScriptedLink::new(vec![StreamEvent::Output(b"x".to_vec())])),
            Duration::from_millis(20),
        );
        let err = s.execute("tail -f /var/log/syslog").unwrap_err();
        assert!(matches!(err, RemoteError::CommandIncomplete { .. }));
    }

    #[test]
    fn test_execute_after_close_is_rejected() {
        let link = ScriptedLink::new(vec![StreamEvent::Exited(Some(0))]);
        let disconnects = link.disconnects.clone();
        let mut s = RemoteSession::new("203.0.113.10", "root", Box::new(link), Duration::from_secs(1));

        s.close().unwrap();
        assert!(matches!(s.execute("true"), Err(RemoteError::SessionClosed { .. })));
        assert!(matches!(s.close(), Err(RemoteError::SessionClosed { .. })));
        drop(s);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_link() {
        let link = ScriptedLink::new(vec![]);
        let disconnects = link.disconnects.clone();
        drop(RemoteSession::new("h", "root", Box::new(link), Duration::from_secs(1)));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
