// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote session providers
//!
//! The dispatcher only needs two capabilities from a transport: open an
//! authenticated session to a `host:port`, and run a command on it while
//! exposing the command's output streams and exit status. Providers:
//!
//! * [`OpenSshProvider`] drives the system `ssh` client with agent auth
//! * [`DryRunProvider`] connects nowhere and reports what would run

mod dry_run;
mod openssh;

pub use dry_run::DryRunProvider;
pub use openssh::OpenSshProvider;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::Result;
use crate::hosts::TargetHost;

/// Output stream of a running remote command
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// A started remote command.
///
/// `exit` resolves once the command finished; `Ok(None)` means it ended
/// without an exit code (killed by a signal). Both streams must be drained
/// for the command to make progress.
pub struct RemoteCommand {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: BoxFuture<'static, Result<Option<i32>>>,
}

/// Credential source handed to providers at dial time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Keys held by an ssh-agent listening on this socket
    Agent { socket: PathBuf },
}

/// Agent-backed auth from `SSH_AUTH_SOCK`, if the agent is reachable.
///
/// Returns `None` rather than an error: a missing agent only matters when a
/// provider actually needs to authenticate, and that surfaces at dial time.
pub fn agent_auth() -> Option<AuthMethod> {
    let socket = PathBuf::from(std::env::var_os("SSH_AUTH_SOCK")?);
    if agent_reachable(&socket) {
        Some(AuthMethod::Agent { socket })
    } else {
        debug!(socket = %socket.display(), "ssh-agent socket not reachable");
        None
    }
}

#[cfg(unix)]
fn agent_reachable(socket: &std::path::Path) -> bool {
    std::os::unix::net::UnixStream::connect(socket).is_ok()
}

#[cfg(not(unix))]
fn agent_reachable(_socket: &std::path::Path) -> bool {
    false
}

/// Opens sessions to remote hosts
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Open an authenticated session to `target` as `identity`
    async fn dial(
        &self,
        target: &TargetHost,
        identity: &str,
        auth: Option<&AuthMethod>,
    ) -> Result<Box<dyn Session>>;
}

/// An open session bound to one host
#[async_trait]
pub trait Session: Send + Sync {
    /// Start `command`; the returned streams and exit future belong to it
    async fn run(&self, command: &str) -> Result<RemoteCommand>;

    /// Release the session
    async fn close(&self) {}
}
