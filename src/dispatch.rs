// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded host dispatch
//!
//! A producer normalizes raw host entries into the host queue. A single
//! consumer drains the queue in order, takes one concurrency token per host
//! (waiting while the pool is exhausted) and spawns a worker for it. Each
//! worker runs the session pipeline under its own retry budget, records
//! exactly one outcome and gives its token back however it finishes.
//!
//! Per host: `Queued → AcquiringToken → Running → Releasing → Done`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::HostCache;
use crate::error::{FlockError, Result};
use crate::hosts::{resolve_raw_hosts, TargetHost};
use crate::identity::{UsernameResolver, UsernameTable};
use crate::output::{drain_command, OutputSink};
use crate::recipe::{Recipe, MAX_CONCURRENCY};
use crate::retry::{retry_notify, RetryPolicy};
use crate::session::{AuthMethod, RemoteCommand, Session, SessionProvider};

/// Where a host is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Queued,
    AcquiringToken,
    Running,
    Releasing,
    Done,
}

impl fmt::Display for HostState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Queued => write!(formatter, "queued"),
            HostState::AcquiringToken => write!(formatter, "acquiring-token"),
            HostState::Running => write!(formatter, "running"),
            HostState::Releasing => write!(formatter, "releasing"),
            HostState::Done => write!(formatter, "done"),
        }
    }
}

fn trace_state(target: &TargetHost, state: HostState) {
    trace!(host = %target, state = %state, "Host state");
}

/// Terminal result for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HostOutcome {
    Success,
    Failed(String),
}

/// What happened on one host
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub user: String,
    pub outcome: HostOutcome,
    pub session_attempts: u32,
    pub commands_succeeded: usize,
    pub commands_failed: usize,
    pub duration_ms: u64,
}

/// Aggregate result of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub recipe: String,
    /// Raw host entries handed to the run
    pub requested: usize,
    /// Entries dropped because they were not a valid `host:port`
    pub invalid: usize,
    pub success: usize,
    pub failed: usize,
    /// Valid hosts never dispatched because the run halted first
    pub skipped: usize,
    pub cancelled: bool,
    /// Most hosts holding a concurrency token at the same time
    pub peak_in_flight: usize,
    pub duration_ms: u64,
    pub hosts: Vec<HostReport>,
}

impl RunSummary {
    /// Hosts that passed validation
    pub fn total(&self) -> usize {
        self.requested.saturating_sub(self.invalid)
    }

    /// Every valid host was processed and none failed
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.cancelled
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "Completed recipe: {} - {} success | {} failed | {} total",
            self.recipe,
            self.success,
            self.failed,
            self.total()
        )?;
        if self.skipped > 0 {
            write!(formatter, " | {} skipped", self.skipped)?;
        }
        if self.invalid > 0 {
            write!(formatter, " ({} invalid host entries dropped)", self.invalid)?;
        }
        if self.cancelled {
            write!(formatter, " [cancelled]")?;
        }
        Ok(())
    }
}

/// Everything a run needs to know besides the hosts
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub name: String,
    pub concurrency: usize,
    pub commands: Vec<String>,
    pub default_port: u16,
    /// Login user for every host; `None` defers to the username resolver
    pub user: Option<String>,
    pub fallback_user: String,
    pub retry: RetryPolicy,
    pub wait_between_hosts: Duration,
    pub fail_batch: bool,
    pub abort_on_command_failure: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Option<Duration>,
}

impl DispatchSettings {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            name: String::new(),
            concurrency: 1,
            commands,
            default_port: 22,
            user: None,
            fallback_user: "root".to_string(),
            retry: RetryPolicy::default(),
            wait_between_hosts: Duration::ZERO,
            fail_batch: false,
            abort_on_command_failure: false,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }

    pub fn from_recipe(recipe: &Recipe) -> Self {
        let resilience = &recipe.resilience;
        Self {
            name: recipe.meta.name.clone(),
            concurrency: recipe.overrides.effective_concurrency(),
            commands: recipe.required.all_commands(),
            default_port: recipe.overrides.port,
            user: recipe.overrides.user.clone().filter(|u| !u.is_empty()),
            fallback_user: recipe.overrides.fallback_user.clone(),
            retry: recipe.retry_policy(),
            wait_between_hosts: Duration::from_millis(resilience.wait_ms),
            fail_batch: resilience.fail_batch,
            abort_on_command_failure: resilience.abort_on_command_failure,
            connect_timeout: Duration::from_secs(resilience.connect_timeout_secs),
            command_timeout: resilience.command_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Counters shared by every worker of a run
#[derive(Debug, Default)]
struct Tally {
    success: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: &HostOutcome) {
        let counter = match outcome {
            HostOutcome::Success => &self.success,
            HostOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a Tally);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-run state: the token pool, the counters and the dispatch halt signal
#[derive(Clone)]
struct RunContext {
    tokens: Arc<Semaphore>,
    tally: Arc<Tally>,
    /// Stops dispatch of further hosts; cancelled with the run or by fail_batch
    halt: CancellationToken,
}

impl RunContext {
    fn new(concurrency: usize, cancel: &CancellationToken) -> Self {
        Self {
            tokens: Arc::new(Semaphore::new(concurrency.clamp(1, MAX_CONCURRENCY))),
            tally: Arc::new(Tally::default()),
            halt: cancel.child_token(),
        }
    }
}

/// Intake side of the host queue
struct HostQueue {
    sender: mpsc::UnboundedSender<TargetHost>,
    default_port: u16,
}

impl HostQueue {
    fn new(default_port: u16) -> (Self, mpsc::UnboundedReceiver<TargetHost>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                default_port,
            },
            receiver,
        )
    }

    /// Normalize and enqueue one entry; malformed entries are logged and dropped
    fn enqueue(&self, raw: &str) -> bool {
        match TargetHost::parse(raw, self.default_port) {
            Ok(target) => {
                trace_state(&target, HostState::Queued);
                self.sender.send(target).is_ok()
            }
            Err(err) => {
                warn!(error = %err, "Skipping host");
                false
            }
        }
    }

    /// Enqueue every entry and close the queue; returns how many were dropped
    fn enqueue_all(self, raw_hosts: Vec<String>) -> usize {
        raw_hosts.iter().filter(|raw| !self.enqueue(raw)).count()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CommandTally {
    succeeded: usize,
    failed: usize,
}

/// Shared, read-only state every worker runs against
struct Worker {
    settings: DispatchSettings,
    provider: Arc<dyn SessionProvider>,
    identities: UsernameResolver,
    auth: Option<AuthMethod>,
    sink: OutputSink,
    cancel: CancellationToken,
}

impl Worker {
    async fn process_host(
        &self,
        target: TargetHost,
        permit: OwnedSemaphorePermit,
        ctx: RunContext,
    ) -> HostReport {
        let slot = ctx.tally.enter();
        trace_state(&target, HostState::Running);

        let report = self.execute_host(&target).await;
        ctx.tally.record(&report.outcome);

        if self.settings.fail_batch
            && matches!(report.outcome, HostOutcome::Failed(_))
            && !ctx.halt.is_cancelled()
        {
            warn!(host = %target, "Host failed with fail_batch set; halting dispatch");
            ctx.halt.cancel();
        }

        trace_state(&target, HostState::Releasing);
        drop(slot);
        drop(permit);
        trace_state(&target, HostState::Done);
        report
    }

    async fn execute_host(&self, target: &TargetHost) -> HostReport {
        let started = Instant::now();
        let user = self
            .settings
            .user
            .clone()
            .unwrap_or_else(|| self.identities.resolve(target.hostname()));
        let attempts = AtomicU32::new(0);

        let result = {
            let worker = self;
            let user = user.as_str();
            let attempts = &attempts;
            retry_notify(
                &self.settings.retry,
                &self.cancel,
                move |attempt| {
                    attempts.store(attempt, Ordering::SeqCst);
                    worker.run_session(target, user, attempt)
                },
                |err, delay, attempt| {
                    warn!(
                        host = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Session attempt failed; retrying"
                    )
                },
            )
            .await
        };

        let (outcome, commands) = match result {
            Ok(commands) => {
                if commands.failed > 0 {
                    warn!(
                        host = %target,
                        succeeded = commands.succeeded,
                        failed = commands.failed,
                        "Host completed with failed commands"
                    );
                } else {
                    info!(host = %target, commands = commands.succeeded, "Host completed");
                }
                (HostOutcome::Success, commands)
            }
            Err(err) => {
                error!(host = %target, error = %err, "Host failed");
                (HostOutcome::Failed(err.to_string()), CommandTally::default())
            }
        };

        HostReport {
            host: target.to_string(),
            user,
            outcome,
            session_attempts: attempts.load(Ordering::SeqCst),
            commands_succeeded: commands.succeeded,
            commands_failed: commands.failed,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// One session attempt: dial, then run every command in order
    async fn run_session(
        &self,
        target: &TargetHost,
        user: &str,
        attempt: u32,
    ) -> Result<CommandTally> {
        debug!(host = %target, user = %user, attempt, provider = self.provider.name(), "Dialing host");

        let dial = self.provider.dial(target, user, self.auth.as_ref());
        let session = match timeout(self.settings.connect_timeout, dial).await {
            Ok(session) => session?,
            Err(_) => {
                return Err(FlockError::Dial {
                    host: target.to_string(),
                    message: format!(
                        "timed out after {} seconds",
                        self.settings.connect_timeout.as_secs()
                    ),
                })
            }
        };

        let mut tally = CommandTally::default();
        let mut cancelled = false;

        for (index, command) in self.settings.commands.iter().enumerate() {
            match self.run_command(session.as_ref(), target, index + 1, command).await {
                Ok(()) => tally.succeeded += 1,
                Err(FlockError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    tally.failed += 1;
                    error!(
                        host = %target,
                        index = index + 1,
                        command = %command,
                        error = %err,
                        "Command failed after retries"
                    );
                    if self.settings.abort_on_command_failure {
                        warn!(host = %target, "Skipping remaining commands for this host");
                        break;
                    }
                }
            }
        }

        session.close().await;

        if cancelled {
            Err(FlockError::Cancelled)
        } else {
            Ok(tally)
        }
    }

    async fn run_command(
        &self,
        session: &dyn Session,
        target: &TargetHost,
        index: usize,
        command: &str,
    ) -> Result<()> {
        let worker = self;
        retry_notify(
            &self.settings.retry,
            &self.cancel,
            move |attempt| worker.run_command_once(session, target, command, attempt),
            |err, delay, attempt| {
                warn!(
                    host = %target,
                    index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Command attempt failed; retrying"
                )
            },
        )
        .await
    }

    /// Run one command attempt; returns after both output drains finished
    async fn run_command_once(
        &self,
        session: &dyn Session,
        target: &TargetHost,
        command: &str,
        attempt: u32,
    ) -> Result<()> {
        let RemoteCommand {
            stdout,
            stderr,
            exit,
        } = session.run(command).await?;

        let host = target.hostname();
        let finished = async {
            let (drained, status) = tokio::join!(
                drain_command(host, attempt, stdout, stderr, &self.sink, &self.cancel),
                exit
            );
            status.map(|code| (code, drained))
        };

        let (code, drained) = match self.settings.command_timeout {
            Some(limit) => timeout(limit, finished)
                .await
                .map_err(|_| FlockError::CommandTimeout {
                    host: target.to_string(),
                    command: command.to_string(),
                    secs: limit.as_secs(),
                })??,
            None => finished.await?,
        };

        match code {
            Some(0) => debug!(
                host = %target,
                command = %command,
                stdout_lines = drained.stdout_lines,
                stderr_lines = drained.stderr_lines,
                "Command completed"
            ),
            Some(code) => warn!(host = %target, command = %command, code, "Command exited with non-zero status"),
            None => warn!(host = %target, command = %command, "Command ended without an exit status"),
        }

        Ok(())
    }
}

/// Runs a command sequence across hosts with bounded concurrency
pub struct Dispatcher {
    settings: DispatchSettings,
    provider: Arc<dyn SessionProvider>,
    identities: UsernameResolver,
    auth: Option<AuthMethod>,
    sink: OutputSink,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(settings: DispatchSettings, provider: Arc<dyn SessionProvider>) -> Self {
        let identities =
            UsernameResolver::new(UsernameTable::default(), None, settings.fallback_user.clone());
        Self {
            settings,
            provider,
            identities,
            auth: None,
            sink: OutputSink::stdout(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_identities(mut self, identities: UsernameResolver) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_auth(mut self, auth: Option<AuthMethod>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    /// Use an externally owned cancellation token for this dispatcher's runs
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Process every raw host entry; returns once all of them reached `Done`
    pub async fn run(&self, raw_hosts: Vec<String>) -> RunSummary {
        let started = Instant::now();
        let requested = raw_hosts.len();

        let worker = Arc::new(Worker {
            settings: self.settings.clone(),
            provider: self.provider.clone(),
            identities: self.identities.clone(),
            auth: self.auth.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        });
        let ctx = RunContext::new(self.settings.concurrency, &self.cancel);

        let (queue, mut intake) = HostQueue::new(self.settings.default_port);
        let producer = tokio::spawn(async move { queue.enqueue_all(raw_hosts) });

        let mut workers = JoinSet::new();
        let mut reports = Vec::new();
        let mut dispatched = 0usize;

        while let Some(target) = intake.recv().await {
            if ctx.halt.is_cancelled() {
                debug!(host = %target, "Dispatch halted; skipping host");
                ctx.tally.skip();
                continue;
            }

            if dispatched > 0 && !self.settings.wait_between_hosts.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.halt.cancelled() => {
                        ctx.tally.skip();
                        continue;
                    }
                    _ = tokio::time::sleep(self.settings.wait_between_hosts) => {}
                }
            }

            trace_state(&target, HostState::AcquiringToken);
            let permit = tokio::select! {
                biased;
                _ = ctx.halt.cancelled() => None,
                permit = ctx.tokens.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                ctx.tally.skip();
                continue;
            };

            let worker = worker.clone();
            let task_ctx = ctx.clone();
            workers.spawn(async move { worker.process_host(target, permit, task_ctx).await });
            dispatched += 1;

            while let Some(done) = workers.try_join_next() {
                collect(&ctx, self.settings.fail_batch, done, &mut reports);
            }
        }

        let invalid = match producer.await {
            Ok(invalid) => invalid,
            Err(e) => {
                error!(error = %e, "Host producer task failed");
                0
            }
        };

        while let Some(done) = workers.join_next().await {
            collect(&ctx, self.settings.fail_batch, done, &mut reports);
        }

        let tally = &ctx.tally;
        RunSummary {
            recipe: self.settings.name.clone(),
            requested,
            invalid,
            success: tally.success.load(Ordering::SeqCst),
            failed: tally.failed.load(Ordering::SeqCst),
            skipped: tally.skipped.load(Ordering::SeqCst),
            cancelled: self.cancel.is_cancelled(),
            peak_in_flight: tally.peak_in_flight.load(Ordering::SeqCst),
            duration_ms: started.elapsed().as_millis() as u64,
            hosts: reports,
        }
    }
}

/// Reap a finished worker; a panicked worker never recorded, so count it here
fn collect(
    ctx: &RunContext,
    fail_batch: bool,
    done: std::result::Result<HostReport, JoinError>,
    reports: &mut Vec<HostReport>,
) {
    match done {
        Ok(report) => reports.push(report),
        Err(e) => {
            error!(error = %e, "Host worker panicked");
            ctx.tally.record(&HostOutcome::Failed(e.to_string()));
            if fail_batch && !ctx.halt.is_cancelled() {
                warn!("Host worker panicked with fail_batch set; halting dispatch");
                ctx.halt.cancel();
            }
        }
    }
}

/// Resolve a recipe's hosts and dispatch its commands across them
pub async fn run_recipe(recipe: &Recipe, dispatcher: &Dispatcher) -> Result<RunSummary> {
    let cache = HostCache::from_overrides(&recipe.overrides);
    let raw_hosts = resolve_raw_hosts(&recipe.required, cache.as_ref()).await?;

    info!(
        recipe = %recipe.meta.name,
        hosts = raw_hosts.len(),
        concurrency = dispatcher.settings().concurrency,
        "Starting recipe"
    );

    let summary = dispatcher.run(raw_hosts).await;

    info!(
        recipe = %summary.recipe,
        success = summary.success,
        failed = summary.failed,
        skipped = summary.skipped,
        duration_ms = summary.duration_ms,
        "Recipe completed"
    );

    Ok(summary)
}
