// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recipe loading and validation
//!
//! A recipe is the complete declarative description of one run: which hosts
//! to reach, which commands to run on them, and how hard to try.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{FlockError, Result};
use crate::retry::{BackoffStrategy, RetryPolicy};

/// Most concurrency slots a run can hold
pub const MAX_CONCURRENCY: usize = Semaphore::MAX_PERMITS;

/// Root recipe structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    /// Descriptive metadata
    #[serde(default)]
    pub meta: MetaRecipe,

    /// Execution targets and commands
    #[serde(default)]
    pub required: RequiredRecipe,

    /// Tunable overrides
    #[serde(default)]
    pub overrides: OverridesRecipe,

    /// Retry and failure policy
    #[serde(default)]
    pub resilience: ResilienceRecipe,

    /// Help text shown by `flock validate`
    #[serde(default)]
    pub help: HelpRecipe,

    /// Banner and confirmation prompt
    #[serde(default)]
    pub interaction: InteractionRecipe,
}

/// Descriptive metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaRecipe {
    /// Recipe name used in logs and the final tally
    #[serde(default)]
    pub name: String,

    /// File the recipe was loaded from (filled in by the loader)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// What to run and where
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredRecipe {
    /// A single command, run before `commands`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Ordered command sequence run within one session per host
    #[serde(default)]
    pub commands: Vec<String>,

    /// Explicit host list; takes precedence over `host_lookup_command`
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Command whose stdout is a comma-separated host list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_lookup_command: Option<String>,
}

/// Tunable overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverridesRecipe {
    /// Maximum number of hosts processed at once; values below 1 mean 1
    #[serde(default)]
    pub concurrency: i64,

    /// Login user for every host, bypassing ssh config lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Port applied to hosts that don't carry one
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity used when neither ssh config nor the local user resolves one
    #[serde(default = "default_fallback_user")]
    pub fallback_user: String,

    /// Never read or write the host lookup cache
    #[serde(default)]
    pub host_lookup_cache_disabled: bool,

    /// How long a cached host lookup stays fresh (0 disables caching)
    #[serde(default)]
    pub host_lookup_cache_secs: u64,
}

/// Retry and failure policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceRecipe {
    /// Maximum attempts for a session and for each command
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// How the delay between attempts grows
    #[serde(default)]
    pub retry_backoff_strategy: BackoffStrategy,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for any single retry delay
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Pause between dispatching successive hosts
    #[serde(default)]
    pub wait_ms: u64,

    /// Stop dispatching new hosts after the first host failure
    #[serde(default)]
    pub fail_batch: bool,

    /// Skip the rest of a host's commands once one exhausts its retries
    #[serde(default)]
    pub abort_on_command_failure: bool,

    /// Time limit for establishing a session
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time limit for a single command attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
}

/// Help text
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelpRecipe {
    #[serde(default)]
    pub short: String,
    #[serde(default)]
    pub long: String,
    #[serde(default)]
    pub usage: String,
}

/// Banner and confirmation prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionRecipe {
    /// Text printed before the run starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    /// Ask for confirmation after printing the banner
    #[serde(default)]
    pub prompt_banner: bool,

    /// Color name for the banner (e.g. "yellow")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_color: Option<String>,
}

impl Default for OverridesRecipe {
    fn default() -> Self {
        Self {
            concurrency: 0,
            user: None,
            port: default_port(),
            fallback_user: default_fallback_user(),
            host_lookup_cache_disabled: false,
            host_lookup_cache_secs: 0,
        }
    }
}

impl Default for ResilienceRecipe {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_strategy: BackoffStrategy::default(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            wait_ms: 0,
            fail_batch: false,
            abort_on_command_failure: false,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: None,
        }
    }
}

impl Recipe {
    /// Load a recipe from a TOML file
    ///
    /// The recipe name defaults to the file stem when `[meta] name` is empty.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FlockError::RecipeNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let mut recipe: Recipe =
            toml::from_str(&contents).map_err(|e| FlockError::RecipeParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        recipe.meta.filename = Some(path.display().to_string());
        if recipe.meta.name.is_empty() {
            if let Some(stem) = path.file_stem() {
                recipe.meta.name = stem.to_string_lossy().to_string();
            }
        }

        recipe.validate()?;
        Ok(recipe)
    }

    /// Validate the recipe
    pub fn validate(&self) -> Result<()> {
        if self.required.all_commands().is_empty() {
            return Err(invalid("recipe must specify at least one command"));
        }

        let has_lookup = self
            .required
            .host_lookup_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if self.required.hosts.is_empty() && !has_lookup {
            return Err(invalid(
                "recipe must specify either hosts or host_lookup_command",
            ));
        }

        if self.overrides.port == 0 {
            return Err(invalid("port cannot be 0"));
        }

        if self.resilience.retries == 0 {
            return Err(invalid("retries must be at least 1"));
        }

        if self.resilience.retry_base_delay_ms > self.resilience.retry_max_delay_ms {
            return Err(invalid(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms",
            ));
        }

        Ok(())
    }

    /// Retry policy shared by the session and command scopes
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.resilience.retries,
            self.resilience.retry_backoff_strategy,
            Duration::from_millis(self.resilience.retry_base_delay_ms),
            Duration::from_millis(self.resilience.retry_max_delay_ms),
        )
    }
}

impl RequiredRecipe {
    /// The full ordered command sequence: `command` first, then `commands`
    pub fn all_commands(&self) -> Vec<String> {
        self.command
            .iter()
            .chain(self.commands.iter())
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl OverridesRecipe {
    /// Concurrency coerced into `1..=MAX_CONCURRENCY`
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency < 1 {
            1
        } else {
            usize::try_from(self.concurrency)
                .unwrap_or(usize::MAX)
                .min(MAX_CONCURRENCY)
        }
    }
}

fn invalid(message: &str) -> FlockError {
    FlockError::InvalidRecipe {
        message: message.to_string(),
    }
}

// Default value functions

fn default_port() -> u16 {
    22
}

fn default_fallback_user() -> String {
    "root".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    10
}
