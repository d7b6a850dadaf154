//! PanelProbe remote execution
//!
//! Opens authenticated sessions to instances that may still be booting and
//! runs verification commands on them.
//!
//! ```text
//! SessionFactory::acquire(address, user, password)
//!   ├── attempt 1..=retries: Connector::connect
//!   │     ├── Unreachable   -> pause(interval), try again
//!   │     └── AuthRejected  -> fail immediately
//!   └── exhausted           -> Ok(None)
//!
//! RemoteSession::execute(command)
//!   └── Link::exec -> ExecStream
//!         ├── Output(chunk) ... appended in arrival order
//!         └── Exited(status) -> CommandResult { stdout, status }
//! ```
//!
//! Everything in this crate blocks the calling thread; async callers should
//! run it on a blocking pool.

pub mod error;
pub mod factory;
pub mod session;
pub mod ssh;
pub mod transport;

pub use error::{RemoteError, RemoteResult};
pub use factory::{run_once, Pause, RetryPolicy, SessionFactory, ThreadPause};
pub use session::{CommandResult, RemoteSession};
pub use ssh::Ssh2Connector;
pub use transport::{Connector, ExecStream, Link, StreamEvent};
