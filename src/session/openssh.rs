// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session provider backed by the system OpenSSH client

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{AuthMethod, RemoteCommand, Session, SessionProvider};
use crate::error::{FlockError, Result};
use crate::hosts::TargetHost;

/// Exit status ssh reserves for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Runs commands through `ssh` in batch mode, authenticating via ssh-agent.
///
/// Dialing checks that an agent is available and the host accepts TCP
/// connections; each command is then its own `ssh` invocation.
#[derive(Debug, Clone)]
pub struct OpenSshProvider {
    program: String,
    connect_timeout: Duration,
    options: Vec<String>,
}

impl OpenSshProvider {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout,
            options: vec!["StrictHostKeyChecking=accept-new".to_string()],
        }
    }

    /// Use a different ssh binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Add an `-o` option passed to every invocation
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// The argument vector for running `command` on `target`
    pub fn command_args(&self, target: &TargetHost, identity: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.extend([
            "-p".to_string(),
            target.port().to_string(),
            "-l".to_string(),
            identity.to_string(),
            target.hostname().to_string(),
            "--".to_string(),
            command.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl SessionProvider for OpenSshProvider {
    fn name(&self) -> &str {
        "openssh"
    }

    async fn dial(
        &self,
        target: &TargetHost,
        identity: &str,
        auth: Option<&AuthMethod>,
    ) -> Result<Box<dyn Session>> {
        let dial_error = |message: String| FlockError::Dial {
            host: target.to_string(),
            message,
        };

        let Some(AuthMethod::Agent { socket }) = auth else {
            return Err(dial_error(
                "no usable authentication method (is ssh-agent running with SSH_AUTH_SOCK set?)"
                    .to_string(),
            ));
        };

        let connect = TcpStream::connect((target.hostname(), target.port()));
        match timeout(self.connect_timeout, connect).await {
            Ok(Ok(_probe)) => {}
            Ok(Err(e)) => return Err(dial_error(e.to_string())),
            Err(_) => {
                return Err(dial_error(format!(
                    "timed out after {} seconds",
                    self.connect_timeout.as_secs()
                )))
            }
        }

        debug!(host = %target, user = %identity, "Dialed host");

        Ok(Box::new(OpenSshSession {
            provider: self.clone(),
            target: target.clone(),
            identity: identity.to_string(),
            agent_socket: socket.clone(),
        }))
    }
}

struct OpenSshSession {
    provider: OpenSshProvider,
    target: TargetHost,
    identity: String,
    agent_socket: std::path::PathBuf,
}

#[async_trait]
impl Session for OpenSshSession {
    async fn run(&self, command: &str) -> Result<RemoteCommand> {
        let run_error = |message: String| FlockError::CommandRun {
            host: self.target.to_string(),
            command: command.to_string(),
            message,
        };

        let mut child = Command::new(&self.provider.program)
            .args(self.provider.command_args(&self.target, &self.identity, command))
            .env("SSH_AUTH_SOCK", &self.agent_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| run_error(format!("couldn't start ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| run_error("couldn't create pipe to stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| run_error("couldn't create pipe to stderr".to_string()))?;

        let host = self.target.to_string();
        let command = command.to_string();
        let exit = async move {
            let status = child.wait().await.map_err(|e| FlockError::CommandRun {
                host: host.clone(),
                command: command.clone(),
                message: e.to_string(),
            })?;
            match status.code() {
                Some(SSH_TRANSPORT_FAILURE) => Err(FlockError::CommandRun {
                    host,
                    command,
                    message: "ssh exited with status 255".to_string(),
                }),
                code => Ok(code),
            }
        }
        .boxed();

        Ok(RemoteCommand {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit,
        })
    }
}
