// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Flock: fleet command runner for the Kea ecosystem

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kea_flock::{
    cache::HostCache,
    hosts::{resolve_raw_hosts, TargetHost},
    identity::{default_ssh_config_path, UsernameResolver, UsernameTable},
    recipe::InteractionRecipe,
    run_recipe,
    session::{agent_auth, DryRunProvider, OpenSshProvider, SessionProvider},
    DispatchSettings, Dispatcher, OutputSink, Recipe,
};

/// Kea-Flock: The Fleet Runner
///
/// Runs a recipe's commands across many hosts over SSH with bounded
/// concurrency, streaming every host's output as it arrives.
#[derive(Parser, Debug)]
#[command(name = "flock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// ssh client config used to pick the user for each host
    #[arg(long, global = true)]
    ssh_config: Option<PathBuf>,

    /// Dry run mode (print what would run instead of connecting)
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a recipe across its hosts
    #[command(alias = "exec")]
    Run {
        /// Path to the recipe file
        recipe: PathBuf,

        /// Override the recipe's concurrency
        #[arg(short, long)]
        concurrency: Option<i64>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Print the final tally as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a recipe's hosts and the user for each
    #[command(alias = "ls")]
    Hosts {
        /// Path to the recipe file
        recipe: PathBuf,
    },

    /// Validate a recipe file
    Validate {
        /// Path to the recipe file
        recipe: PathBuf,
    },

    /// Write a starter recipe
    Init {
        /// Where to write the recipe
        path: PathBuf,

        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    if cli.no_color {
        colored::control::set_override(false);
    }

    match &cli.command {
        Commands::Version => {
            println!("Kea-Flock v{}", env!("CARGO_PKG_VERSION"));
            println!("The Fleet Runner for the Kea Ecosystem");
            Ok(())
        }

        Commands::Init { path, force } => init_recipe(path, *force),

        Commands::Validate { recipe } => validate_recipe(recipe),

        Commands::Hosts { recipe } => list_hosts(&cli, recipe).await,

        Commands::Run {
            recipe,
            concurrency,
            yes,
            json,
        } => {
            let succeeded = execute_recipe(&cli, recipe, *concurrency, *yes, *json).await?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Logs go to stderr so stdout carries only host output and the tally
fn init_logging(cli: &Cli) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr);

    match cli.log_format {
        LogFormat::Text => builder.with_ansi(!cli.no_color).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_recipe(path: &Path) -> anyhow::Result<Recipe> {
    Recipe::from_file(path).with_context(|| format!("Failed to load recipe: {}", path.display()))
}

fn username_resolver(cli: &Cli, recipe: &Recipe) -> anyhow::Result<UsernameResolver> {
    let table = match cli.ssh_config.clone().or_else(default_ssh_config_path) {
        Some(path) => UsernameTable::load(&path)
            .with_context(|| format!("Failed to read ssh config: {}", path.display()))?,
        None => UsernameTable::default(),
    };
    Ok(UsernameResolver::from_environment(
        table,
        recipe.overrides.fallback_user.clone(),
    ))
}

/// Write a starter recipe
fn init_recipe(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Recipe file already exists: {}. Use --force to overwrite.",
            path.display()
        );
    }

    let starter = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# Kea-Flock recipe

[meta]
name = "uptime"

[required]
commands = ["uptime"]
hosts = ["localhost"]
# host_lookup_command = "inventory --role web --format csv"

[overrides]
concurrency = 4
# user = "deploy"
port = 22
fallback_user = "root"
host_lookup_cache_secs = 0

[resilience]
retries = 3
retry_backoff_strategy = "exponential"
retry_base_delay_ms = 500
retry_max_delay_ms = 60000
wait_ms = 0
fail_batch = false
abort_on_command_failure = false
connect_timeout_secs = 10
# command_timeout_secs = 300

[help]
short = "Show uptime on every host"

[interaction]
# banner = "This touches production hosts"
prompt_banner = false
"#;

    std::fs::write(path, starter)?;
    info!("Created recipe file: {}", path.display());
    println!("Created recipe file: {}", path.display());
    Ok(())
}

/// Validate a recipe file and describe it
fn validate_recipe(path: &Path) -> anyhow::Result<()> {
    info!("Validating recipe: {}", path.display());

    let recipe = load_recipe(path)?;

    println!("Recipe '{}' is valid", recipe.meta.name);
    println!();
    if !recipe.help.short.is_empty() {
        println!("  Summary: {}", recipe.help.short);
    }
    if !recipe.help.usage.is_empty() {
        println!("  Usage: {}", recipe.help.usage);
    }
    println!("  Commands: {}", recipe.required.all_commands().len());
    match &recipe.required.host_lookup_command {
        Some(lookup) if recipe.required.hosts.is_empty() => {
            println!("  Hosts: from `{}`", lookup)
        }
        _ => println!("  Hosts: {}", recipe.required.hosts.len()),
    }
    println!("  Concurrency: {}", recipe.overrides.effective_concurrency());
    println!(
        "  Retries: {} ({:?} backoff)",
        recipe.resilience.retries, recipe.resilience.retry_backoff_strategy
    );
    println!("  Fail batch: {}", recipe.resilience.fail_batch);
    if !recipe.help.long.is_empty() {
        println!();
        println!("{}", recipe.help.long);
    }

    Ok(())
}

/// Resolve a recipe's hosts and print each target with its user
async fn list_hosts(cli: &Cli, path: &Path) -> anyhow::Result<()> {
    let recipe = load_recipe(path)?;
    let resolver = username_resolver(cli, &recipe)?;
    let cache = HostCache::from_overrides(&recipe.overrides);

    let raw_hosts = resolve_raw_hosts(&recipe.required, cache.as_ref())
        .await
        .context("Failed to resolve hosts")?;

    if raw_hosts.is_empty() {
        println!("No hosts resolved for recipe '{}'", recipe.meta.name);
        return Ok(());
    }

    println!("Hosts for recipe '{}':", recipe.meta.name);
    println!();
    for raw in &raw_hosts {
        match TargetHost::parse(raw, recipe.overrides.port) {
            Ok(target) => {
                let user = recipe
                    .overrides
                    .user
                    .clone()
                    .filter(|u| !u.is_empty())
                    .unwrap_or_else(|| resolver.resolve(target.hostname()));
                println!("  - {} (user: {})", target, user);
            }
            Err(e) => println!("  ! {}", e),
        }
    }

    Ok(())
}

/// Print the banner; returns false when the user declines to continue
fn confirm_banner(interaction: &InteractionRecipe, yes: bool, to_stderr: bool) -> anyhow::Result<bool> {
    let Some(banner) = interaction.banner.as_deref().filter(|b| !b.is_empty()) else {
        return Ok(true);
    };

    let banner = match &interaction.prompt_color {
        Some(color) => banner.color(color.as_str()).to_string(),
        None => banner.to_string(),
    };
    if to_stderr {
        eprintln!("{}", banner);
    } else {
        println!("{}", banner);
    }

    if !interaction.prompt_banner || yes {
        return Ok(true);
    }

    eprint!("Continue? [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Run a recipe; returns whether every host succeeded
async fn execute_recipe(
    cli: &Cli,
    path: &Path,
    concurrency: Option<i64>,
    yes: bool,
    json: bool,
) -> anyhow::Result<bool> {
    info!("Loading recipe: {}", path.display());
    let mut recipe = load_recipe(path)?;
    if let Some(concurrency) = concurrency {
        recipe.overrides.concurrency = concurrency;
    }

    if !confirm_banner(&recipe.interaction, yes, json)? {
        eprintln!("Aborted");
        return Ok(true);
    }

    let color = !cli.no_color && !json && std::io::stdout().is_terminal();
    let sink = if json {
        OutputSink::stderr(false)
    } else {
        OutputSink::stdout(color)
    };

    let settings = DispatchSettings::from_recipe(&recipe);
    let provider: Arc<dyn SessionProvider> = if cli.dry_run {
        Arc::new(DryRunProvider)
    } else {
        Arc::new(OpenSshProvider::new(Duration::from_secs(
            recipe.resilience.connect_timeout_secs,
        )))
    };

    let auth = agent_auth();
    if auth.is_none() && !cli.dry_run {
        warn!("No ssh-agent available; sessions will fail to authenticate");
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            on_interrupt.cancel();
        }
    });

    let dispatcher = Dispatcher::new(settings, provider)
        .with_identities(username_resolver(cli, &recipe)?)
        .with_auth(auth)
        .with_sink(sink.clone())
        .with_cancellation(cancel);

    let starting = format!("Starting recipe: {}", recipe.meta.name);
    sink.line(&if sink.is_colored() {
        starting.green().to_string()
    } else {
        starting
    });

    let summary = run_recipe(&recipe, &dispatcher).await;
    sink.flush().await;
    let summary = summary?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let line = summary.to_string();
        sink.line(&if !sink.is_colored() {
            line
        } else if summary.all_succeeded() {
            line.green().to_string()
        } else {
            line.yellow().to_string()
        });
        sink.flush().await;
    }

    Ok(summary.all_succeeded())
}
