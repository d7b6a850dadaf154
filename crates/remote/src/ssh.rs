//! libssh2-backed transport

use ssh2::{Channel, ErrorCode, ExtendedData, Session};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::transport::{Connector, ExecStream, Link, StreamEvent};

const READ_CHUNK: usize = 4096;

// libssh2 error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Password-authenticated SSH connections via libssh2.
///
/// Host keys are not verified: the instances under test are created moments
/// before the first connection and have no known key yet.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            read_timeout: Duration::from_secs(1),
        }
    }

    /// How long a single read may block before reporting [`StreamEvent::Pending`]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn open_tcp(&self, address: &str) -> RemoteResult<TcpStream> {
        let unreachable = |reason: String| RemoteError::Unreachable {
            address: address.to_string(),
            reason,
        };

        let candidates: Vec<SocketAddr> = (address, self.port)
            .to_socket_addrs()
            .map_err(|e| unreachable(e.to_string()))?
            .collect();

        let mut last_error = format!("no addresses resolved for {}", address);
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = format!("{}: {}", candidate, e),
            }
        }
        Err(unreachable(last_error))
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(22, Duration::from_secs(10))
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, address: &str, username: &str, password: &str) -> RemoteResult<Box<dyn Link>> {
        let tcp = self.open_tcp(address)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(self.connect_timeout));

        // sshd accepting TCP but not yet speaking SSH is still part of booting
        session.handshake().map_err(|e| RemoteError::Unreachable {
            address: address.to_string(),
            reason: format!("handshake failed: {}", e),
        })?;

        session
            .userauth_password(username, password)
            .map_err(|e| auth_error(address, username, &e))?;
        if !session.authenticated() {
            return Err(RemoteError::AuthRejected {
                address: address.to_string(),
                username: username.to_string(),
            });
        }

        session.set_timeout(timeout_millis(self.read_timeout));
        debug!("Authenticated {}@{}:{}", username, address, self.port);
        Ok(Box::new(Ssh2Link { session }))
    }
}

struct Ssh2Link {
    session: Session,
}

impl Link for Ssh2Link {
    fn exec(&mut self, command: &str) -> RemoteResult<Box<dyn ExecStream + '_>> {
        let mut channel = self.session.channel_session()?;
        // stderr is discarded so a chatty command cannot stall the stdout window
        channel.handle_extended_data(ExtendedData::Ignore)?;
        channel.exec(command)?;
        Ok(Box::new(Ssh2Exec {
            channel,
            buf: vec![0; READ_CHUNK],
        }))
    }

    fn disconnect(&mut self) -> RemoteResult<()> {
        self.session.disconnect(None, "panelprobe: session closed", None)?;
        Ok(())
    }
}

struct Ssh2Exec {
    channel: Channel,
    buf: Vec<u8>,
}

impl Ssh2Exec {
    /// Stdout is at EOF; the process may still be running
    fn finish(&mut self) -> RemoteResult<StreamEvent> {
        if let Err(e) = self.channel.wait_close() {
            return if is_would_block(&e) {
                Ok(StreamEvent::Pending)
            } else {
                Err(e.into())
            };
        }
        let signal = self.channel.exit_signal()?;
        if let Some(name) = signal.exit_signal {
            debug!("Remote process terminated by signal {}", name);
            return Ok(StreamEvent::Exited(None));
        }
        Ok(StreamEvent::Exited(Some(self.channel.exit_status()?)))
    }
}

impl ExecStream for Ssh2Exec {
    fn next_event(&mut self) -> RemoteResult<StreamEvent> {
        match self.channel.read(&mut self.buf) {
            Ok(0) => self.finish(),
            Ok(n) => Ok(StreamEvent::Output(self.buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(StreamEvent::Pending),
            Err(e) => Err(RemoteError::Transport(e.to_string())),
        }
    }
}

/// libssh2 takes milliseconds as `u32`; longer timeouts saturate
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Only an explicit refusal of the credentials is final. A reset or a timeout
/// during authentication comes from a host that is still booting.
fn auth_error(address: &str, username: &str, e: &ssh2::Error) -> RemoteError {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => RemoteError::AuthRejected {
            address: address.to_string(),
            username: username.to_string(),
        },
        _ => RemoteError::Unreachable {
            address: address.to_string(),
            reason: format!("authentication interrupted: {}", e),
        },
    }
}

fn is_would_block(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_refused_credentials_are_final() {
        let e = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "Authentication failed (username/password)",
        );
        let mapped = auth_error("203.0.113.10", "root", &e);
        assert_eq!(
            mapped,
            RemoteError::AuthRejected {
                address: "203.0.113.10".to_string(),
                username: "root".to_string(),
            }
        );
        assert!(!mapped.is_retryable());
    }

    #[test_case(ErrorCode::Session(-7) ; "socket send failure")]
    #[test_case(ErrorCode::Session(-13) ; "socket disconnect")]
    #[test_case(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) ; "timeout")]
    #[test_case(ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) ; "would block")]
    fn test_interrupted_authentication_is_retryable(code: ErrorCode) {
        let e = ssh2::Error::new(code, "transport went away");
        let mapped = auth_error("203.0.113.10", "root", &e);
        assert!(mapped.is_retryable(), "{:?}", mapped);
        assert!(mapped.to_string().contains("authentication interrupted"));
    }

    #[test_case(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), true ; "timeout")]
    #[test_case(ErrorCode::Session(LIBSSH2_ERROR_EAGAIN), true ; "would block")]
    #[test_case(ErrorCode::Session(-13), false ; "socket disconnect")]
    fn test_close_wait_timeout_is_pending(code: ErrorCode, pending: bool) {
        assert_eq!(is_would_block(&ssh2::Error::new(code, "waiting")), pending);
    }

    #[test]
    fn test_timeout_millis_saturates() {
        assert_eq!(timeout_millis(Duration::from_secs(10)), 10_000);
        assert_eq!(timeout_millis(Duration::from_secs(u64::from(u32::MAX))), u32::MAX);
    }
}
