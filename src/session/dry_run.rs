// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider that connects nowhere

use async_trait::async_trait;
use futures::FutureExt;

use super::{AuthMethod, RemoteCommand, Session, SessionProvider};
use crate::error::Result;
use crate::hosts::TargetHost;

/// Echoes what would run on each host instead of running it
#[derive(Debug, Clone, Default)]
pub struct DryRunProvider;

#[async_trait]
impl SessionProvider for DryRunProvider {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn dial(
        &self,
        target: &TargetHost,
        identity: &str,
        _auth: Option<&AuthMethod>,
    ) -> Result<Box<dyn Session>> {
        Ok(Box::new(DryRunSession {
            destination: format!("{}@{}", identity, target),
        }))
    }
}

struct DryRunSession {
    destination: String,
}

#[async_trait]
impl Session for DryRunSession {
    async fn run(&self, command: &str) -> Result<RemoteCommand> {
        let line = format!("[DRY RUN] Would run `{}` as {}\n", command, self.destination);
        Ok(RemoteCommand {
            stdout: Box::pin(std::io::Cursor::new(line.into_bytes())),
            stderr: Box::pin(tokio::io::empty()),
            exit: async { Ok(Some(0)) }.boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_dry_run_reports_command() {
        let target = TargetHost::parse("web-01", 22).unwrap();
        let session = DryRunProvider.dial(&target, "deploy", None).await.unwrap();
        let mut remote = session.run("uptime").await.unwrap();

        let mut out = String::new();
        remote.stdout.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("DRY RUN"));
        assert!(out.contains("deploy@web-01:22"));
        assert_eq!(remote.exit.await.unwrap(), Some(0));
    }
}
