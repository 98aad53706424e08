// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Kea-Flock

use thiserror::Error;

/// Result type alias for Kea-Flock operations
pub type Result<T> = std::result::Result<T, FlockError>;

/// Errors that can occur while resolving, dispatching, or running a recipe
#[derive(Error, Debug)]
pub enum FlockError {
    /// Recipe file not found
    #[error("Recipe file not found: {path}")]
    RecipeNotFound { path: String },

    /// Recipe failed to parse
    #[error("Failed to parse recipe '{path}': {message}")]
    RecipeParse { path: String, message: String },

    /// Recipe parsed but is not runnable
    #[error("Invalid recipe: {message}")]
    InvalidRecipe { message: String },

    /// Host entry is not a well-formed host:port pair
    #[error("Couldn't parse host '{raw}': {reason}")]
    HostParse { raw: String, reason: String },

    /// Dynamic host lookup could not be executed
    #[error("Host lookup command '{command}' failed: {message}")]
    DiscoveryCommand { command: String, message: String },

    /// A `Host` pattern in the ssh config is not a valid glob
    #[error("Host glob '{pattern}' is not in a valid glob format: {message}")]
    SshConfigPattern { pattern: String, message: String },

    /// Failed to open a session to a host
    #[error("Failed to dial remote host {host}: {message}")]
    Dial { host: String, message: String },

    /// A command could not be started or the transport broke while running it
    #[error("Command `{command}` on {host} failed: {message}")]
    CommandRun {
        host: String,
        command: String,
        message: String,
    },

    /// A single command attempt exceeded its time limit
    #[error("Command `{command}` on {host} timed out after {secs} seconds")]
    CommandTimeout {
        host: String,
        command: String,
        secs: u64,
    },

    /// Reading a command's output stream failed
    #[error("Error reading {stream} from {host}: {source}")]
    StreamRead {
        host: String,
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled before this unit of work finished
    #[error("Run cancelled")]
    Cancelled,

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl FlockError {
    /// Whether the retry wrapper may attempt the failed operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlockError::Dial { .. } | FlockError::CommandRun { .. } | FlockError::CommandTimeout { .. }
        )
    }
}
