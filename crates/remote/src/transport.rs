//! Transport seams between the session logic and the SSH library

use crate::error::RemoteResult;

/// Opens one authenticated connection per call.
///
/// Implementations must report a host that is not accepting connections as
/// [`RemoteError::Unreachable`](crate::RemoteError::Unreachable) and refused
/// credentials as [`RemoteError::AuthRejected`](crate::RemoteError::AuthRejected);
/// the session factory retries only the former.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str, username: &str, password: &str) -> RemoteResult<Box<dyn Link>>;
}

/// One live, authenticated connection
pub trait Link: Send {
    /// Start `command` on the remote host
    fn exec(&mut self, command: &str) -> RemoteResult<Box<dyn ExecStream + '_>>;

    /// Release the connection
    fn disconnect(&mut self) -> RemoteResult<()>;
}

/// What the remote process reported since the last read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of standard output
    Output(Vec<u8>),
    /// Nothing arrived within the transport's read timeout
    Pending,
    /// The process completed. `None` when it ended without reporting a status
    /// (killed by a signal, channel torn down).
    Exited(Option<i32>),
}

/// Output of one running remote command
pub trait ExecStream {
    fn next_event(&mut self) -> RemoteResult<StreamEvent>;
}
