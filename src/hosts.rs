// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host resolution
//!
//! Turns a recipe's static host list, or the output of its host lookup
//! command, into raw host entries, and normalizes each entry into a
//! validated `host:port` target.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cache::HostCache;
use crate::error::{FlockError, Result};
use crate::recipe::RequiredRecipe;

/// A validated `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetHost {
    host: String,
    port: u16,
}

impl TargetHost {
    /// Normalize a raw entry: trim it, append `default_port` when it carries
    /// no `:`, then validate it as a `host:port` pair.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self> {
        let trimmed = raw.trim();
        let candidate = if trimmed.contains(':') {
            trimmed.to_string()
        } else {
            format!("{}:{}", trimmed, default_port)
        };

        let (host, port) = split_host_port(&candidate).map_err(|reason| FlockError::HostParse {
            raw: candidate.clone(),
            reason,
        })?;

        Ok(Self { host, port })
    }

    /// Host part without the port
    pub fn hostname(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetHost {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(formatter, "[{}]:{}", self.host, self.port)
        } else {
            write!(formatter, "{}:{}", self.host, self.port)
        }
    }
}

fn split_host_port(address: &str) -> std::result::Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| "missing ']' in address".to_string())?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        host.parse::<Ipv6Addr>()
            .map_err(|_| format!("'{}' is not an IPv6 address", host))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        if host.contains(':') {
            return Err("too many colons in address".to_string());
        }
        validate_hostname(host)?;
        (host, port)
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))?;
    if port == 0 {
        return Err("port cannot be 0".to_string());
    }

    Ok((host.to_string(), port))
}

fn validate_hostname(host: &str) -> std::result::Result<(), String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }
    if host.len() > 253 {
        return Err("host name too long".to_string());
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("invalid label in '{}'", host));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{}' cannot start or end with '-'", label));
        }
        if let Some(bad) = label
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(format!("invalid character '{}'", bad));
        }
    }

    Ok(())
}

/// Produce the raw host entries for a run.
///
/// An explicit host list wins outright. Otherwise the lookup command is run
/// (or served from `cache`) and its output split on commas. Failure to run
/// the lookup command is fatal to the run.
pub async fn resolve_raw_hosts(
    required: &RequiredRecipe,
    cache: Option<&HostCache>,
) -> Result<Vec<String>> {
    let lookup = required
        .host_lookup_command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if !required.hosts.is_empty() {
        if lookup.is_some() {
            warn!("Both hosts and host_lookup_command are set; using the explicit host list");
        }
        return Ok(required.hosts.clone());
    }

    let command = lookup.ok_or_else(|| FlockError::InvalidRecipe {
        message: "recipe must specify either hosts or host_lookup_command".to_string(),
    })?;

    if let Some(hosts) = cache.and_then(|c| c.load(command)) {
        info!(command = %command, hosts = hosts.len(), "Using cached host lookup");
        return Ok(hosts);
    }

    let output = run_discovery(command).await?;
    let hosts = split_host_list(&output);

    if let Some(cache) = cache {
        cache.store(command, &hosts);
    }

    Ok(hosts)
}

/// Run a host lookup command and return its stdout.
///
/// The command line is split on whitespace; the first token is the program.
pub async fn run_discovery(command_line: &str) -> Result<String> {
    let mut parts = command_line.split_whitespace();
    let program = parts.next().ok_or_else(|| FlockError::DiscoveryCommand {
        command: command_line.to_string(),
        message: "empty command".to_string(),
    })?;

    debug!(command = %command_line, "Running host lookup command");

    let output = Command::new(program)
        .args(parts)
        .output()
        .await
        .map_err(|e| FlockError::DiscoveryCommand {
            command: command_line.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(FlockError::DiscoveryCommand {
            command: command_line.to_string(),
            message: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Split lookup output into raw entries; normalization happens later.
pub fn split_host_list(output: &str) -> Vec<String> {
    output.split(',').map(str::to_string).collect()
}
