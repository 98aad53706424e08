// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher behavior against a scripted session provider

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use kea_flock::output::MemoryBuffer;
use kea_flock::session::RemoteCommand;
use kea_flock::{
    AuthMethod, BackoffStrategy, DispatchSettings, Dispatcher, FlockError, HostOutcome,
    OutputSink, Result, RetryPolicy, RunSummary, Session, SessionProvider, TargetHost,
};

#[derive(Clone)]
struct Script {
    /// Dials refused per host before one succeeds
    dial_failures: HashMap<String, u32>,
    broken_commands: HashSet<String>,
    panic_hosts: HashSet<String>,
    lines: usize,
    exit_code: Option<i32>,
    delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            dial_failures: HashMap::new(),
            broken_commands: HashSet::new(),
            panic_hosts: HashSet::new(),
            lines: 1,
            exit_code: Some(0),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Counters {
    dials: Mutex<HashMap<String, u32>>,
    /// Attempts per (host, command)
    runs: Mutex<HashMap<(String, String), u32>>,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

struct ScriptedProvider {
    script: Script,
    counters: Arc<Counters>,
}

impl ScriptedProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            counters: Arc::new(Counters::default()),
        })
    }

    fn dials(&self, host: &str) -> u32 {
        self.counters.dials.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    fn runs(&self, host: &str, command: &str) -> u32 {
        self.counters
            .runs
            .lock()
            .unwrap()
            .get(&(host.to_string(), command.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn max_open(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn dial(
        &self,
        target: &TargetHost,
        _identity: &str,
        _auth: Option<&AuthMethod>,
    ) -> Result<Box<dyn Session>> {
        let host = target.hostname().to_string();
        if self.script.panic_hosts.contains(&host) {
            panic!("scripted panic on {}", host);
        }

        let attempt = {
            let mut dials = self.counters.dials.lock().unwrap();
            let count = dials.entry(host.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let refusals = self.script.dial_failures.get(&host).copied().unwrap_or(0);
        if attempt <= refusals {
            return Err(FlockError::Dial {
                host: target.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let now = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            host,
            script: self.script.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    script: Script,
    counters: Arc<Counters>,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn run(&self, command: &str) -> Result<RemoteCommand> {
        *self
            .counters
            .runs
            .lock()
            .unwrap()
            .entry((self.host.clone(), command.to_string()))
            .or_insert(0) += 1;

        if self.script.broken_commands.contains(command) {
            return Err(FlockError::CommandRun {
                host: self.host.clone(),
                command: command.to_string(),
                message: "channel closed".to_string(),
            });
        }

        let body: String = (1..=self.script.lines)
            .map(|i| format!("line {} from {}\n", i, self.host))
            .collect();
        let delay = self.script.delay;
        let code = self.script.exit_code;

        Ok(RemoteCommand {
            stdout: Box::pin(Cursor::new(body.into_bytes())),
            stderr: Box::pin(tokio::io::empty()),
            exit: async move {
                tokio::time::sleep(delay).await;
                Ok(code)
            }
            .boxed(),
        })
    }
}

fn settings(concurrency: usize, commands: &[&str]) -> DispatchSettings {
    let mut settings = DispatchSettings::new(commands.iter().map(|c| c.to_string()).collect());
    settings.name = "scripted".to_string();
    settings.concurrency = concurrency;
    settings.retry = RetryPolicy::new(
        3,
        BackoffStrategy::Fixed,
        Duration::from_millis(1),
        Duration::from_millis(1),
    );
    settings
}

fn hosts(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("host-{:02}", i)).collect()
}

async fn run(
    provider: &Arc<ScriptedProvider>,
    settings: DispatchSettings,
    raw_hosts: Vec<String>,
) -> (RunSummary, MemoryBuffer) {
    let (sink, buffer) = OutputSink::memory();
    let dispatcher = Dispatcher::new(settings, provider.clone()).with_sink(sink);
    (dispatcher.run(raw_hosts).await, buffer)
}

fn assert_accounted(summary: &RunSummary) {
    assert_eq!(
        summary.success + summary.failed + summary.skipped,
        summary.total(),
        "every valid host ends in exactly one bucket: {:?}",
        summary
    );
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let provider = ScriptedProvider::new(Script {
        delay: Duration::from_millis(20),
        ..Default::default()
    });

    let (summary, _) = run(&provider, settings(3, &["uptime"]), hosts(20)).await;

    assert_eq!(summary.success, 20);
    assert_accounted(&summary);
    assert!(provider.max_open() <= 3, "max open {}", provider.max_open());
    assert!(summary.peak_in_flight <= 3);
    assert!(summary.peak_in_flight >= 1);
}

#[tokio::test]
async fn test_concurrency_one_is_sequential() {
    let provider = ScriptedProvider::new(Script {
        delay: Duration::from_millis(5),
        ..Default::default()
    });

    let (summary, buffer) = run(&provider, settings(1, &["uptime"]), hosts(5)).await;

    assert_eq!(summary.success, 5);
    assert_eq!(provider.max_open(), 1);
    assert_eq!(summary.peak_in_flight, 1);

    let order: Vec<String> = buffer
        .contents()
        .lines()
        .map(|line| line.split(':').next().unwrap().to_string())
        .collect();
    assert_eq!(order, hosts(5));
}

#[tokio::test]
async fn test_limit_above_host_count() {
    let provider = ScriptedProvider::new(Script::default());

    let (summary, _) = run(&provider, settings(10, &["uptime"]), hosts(4)).await;

    assert_eq!(summary.success, 4);
    assert!(summary.peak_in_flight <= 4);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_no_hosts() {
    let provider = ScriptedProvider::new(Script::default());

    let (summary, buffer) = run(&provider, settings(4, &["uptime"]), Vec::new()).await;

    assert_eq!(summary.total(), 0);
    assert!(summary.hosts.is_empty());
    assert!(buffer.contents().is_empty());
}

#[tokio::test]
async fn test_malformed_entries_never_dispatch() {
    let provider = ScriptedProvider::new(Script::default());
    let raw = vec![
        "good-01".to_string(),
        "bad host".to_string(),
        "good-02:70000".to_string(),
        "good-03:2222".to_string(),
    ];

    let (summary, _) = run(&provider, settings(2, &["uptime"]), raw).await;

    assert_eq!(summary.invalid, 2);
    assert_eq!(summary.total(), 2);
    assert_eq!(summary.success, 2);
    assert_eq!(provider.dials("bad host"), 0);
    assert_eq!(provider.dials("good-02"), 0);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_dial_recovers_within_budget() {
    let provider = ScriptedProvider::new(Script {
        dial_failures: HashMap::from([("flaky".to_string(), 2)]),
        ..Default::default()
    });

    let (summary, _) = run(&provider, settings(1, &["uptime"]), vec!["flaky".to_string()]).await;

    assert_eq!(summary.success, 1);
    assert_eq!(provider.dials("flaky"), 3);
    assert_eq!(summary.hosts[0].session_attempts, 3);
    assert_eq!(summary.hosts[0].outcome, HostOutcome::Success);
}

#[tokio::test]
async fn test_dial_exhausts_budget() {
    let provider = ScriptedProvider::new(Script {
        dial_failures: HashMap::from([("down".to_string(), u32::MAX)]),
        ..Default::default()
    });

    let (summary, _) = run(
        &provider,
        settings(2, &["uptime"]),
        vec!["down".to_string(), "up".to_string()],
    )
    .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.success, 1);
    assert_eq!(provider.dials("down"), 3);

    let down = summary.hosts.iter().find(|r| r.host == "down:22").unwrap();
    assert!(matches!(&down.outcome, HostOutcome::Failed(reason) if reason.contains("connection refused")));
    assert_eq!(down.session_attempts, 3);
    assert!(!summary.all_succeeded());
}

#[tokio::test]
async fn test_output_lines_stay_whole() {
    let provider = ScriptedProvider::new(Script {
        lines: 100,
        ..Default::default()
    });
    let raw = vec!["alpha".to_string(), "bravo".to_string()];

    let (summary, buffer) = run(&provider, settings(2, &["cat big.log"]), raw).await;
    assert_eq!(summary.success, 2);

    let mut per_host: HashMap<String, usize> = HashMap::new();
    for line in buffer.contents().lines() {
        let (host, text) = line.split_once(": ").unwrap();
        assert!(text.starts_with("line "), "garbled line: {}", line);
        assert!(text.ends_with(&format!("from {}", host)), "garbled line: {}", line);
        *per_host.entry(host.to_string()).or_default() += 1;
    }
    assert_eq!(per_host.get("alpha"), Some(&100));
    assert_eq!(per_host.get("bravo"), Some(&100));
}

#[tokio::test]
async fn test_fail_batch_skips_remaining_hosts() {
    let provider = ScriptedProvider::new(Script {
        dial_failures: HashMap::from([("host-00".to_string(), u32::MAX)]),
        ..Default::default()
    });
    let mut settings = settings(1, &["uptime"]);
    settings.fail_batch = true;

    let (summary, _) = run(&provider, settings, hosts(4)).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.success, 0);
    assert_eq!(summary.skipped, 3);
    assert_eq!(provider.dials("host-01"), 0);
    assert_accounted(&summary);
    assert!(summary.to_string().ends_with("| 3 skipped"));
}

#[tokio::test]
async fn test_failed_command_does_not_stop_the_rest() {
    let provider = ScriptedProvider::new(Script {
        broken_commands: HashSet::from(["broken".to_string()]),
        ..Default::default()
    });

    let (summary, buffer) = run(
        &provider,
        settings(1, &["first", "broken", "last"]),
        vec!["web-01".to_string()],
    )
    .await;

    let report = &summary.hosts[0];
    assert_eq!(report.outcome, HostOutcome::Success);
    assert_eq!(report.commands_succeeded, 2);
    assert_eq!(report.commands_failed, 1);
    assert_eq!(provider.dials("web-01"), 1);
    assert_eq!(buffer.contents().lines().count(), 2);
}

#[tokio::test]
async fn test_each_command_has_its_own_retry_budget() {
    let provider = ScriptedProvider::new(Script {
        broken_commands: HashSet::from(["broken".to_string()]),
        ..Default::default()
    });
    let settings = settings(1, &["first", "broken", "last"]);
    let budget = settings.retry.max_attempts;

    let (summary, _) = run(&provider, settings, vec!["web-01".to_string()]).await;

    let report = &summary.hosts[0];
    assert_eq!(report.outcome, HostOutcome::Success);
    assert_eq!(report.session_attempts, 1);
    assert_eq!(provider.dials("web-01"), 1);
    assert_eq!(provider.runs("web-01", "first"), 1);
    assert_eq!(provider.runs("web-01", "broken"), budget);
    assert_eq!(provider.runs("web-01", "last"), 1);
}

#[tokio::test]
async fn test_command_retries_do_not_spend_session_budget() {
    let provider = ScriptedProvider::new(Script {
        dial_failures: HashMap::from([("web-01".to_string(), 2)]),
        broken_commands: HashSet::from(["broken".to_string()]),
        ..Default::default()
    });
    let settings = settings(1, &["broken", "last"]);
    let budget = settings.retry.max_attempts;

    let (summary, _) = run(&provider, settings, vec!["web-01".to_string()]).await;

    let report = &summary.hosts[0];
    assert_eq!(report.outcome, HostOutcome::Success);
    assert_eq!(report.session_attempts, budget);
    assert_eq!(provider.dials("web-01"), budget);
    assert_eq!(provider.runs("web-01", "broken"), budget);
    assert_eq!(provider.runs("web-01", "last"), 1);
    assert_eq!(report.commands_failed, 1);
    assert_eq!(report.commands_succeeded, 1);
}

#[tokio::test]
async fn test_abort_on_command_failure() {
    let provider = ScriptedProvider::new(Script {
        broken_commands: HashSet::from(["broken".to_string()]),
        ..Default::default()
    });
    let mut settings = settings(1, &["first", "broken", "last"]);
    settings.abort_on_command_failure = true;

    let (summary, _) = run(&provider, settings, vec!["web-01".to_string()]).await;

    let report = &summary.hosts[0];
    assert_eq!(report.outcome, HostOutcome::Success);
    assert_eq!(report.commands_succeeded, 1);
    assert_eq!(report.commands_failed, 1);
}

#[tokio::test]
async fn test_non_zero_exit_is_not_a_failure() {
    let provider = ScriptedProvider::new(Script {
        exit_code: Some(3),
        ..Default::default()
    });

    let (summary, _) = run(&provider, settings(1, &["grep nothing"]), hosts(2)).await;

    assert_eq!(summary.success, 2);
    assert!(summary.hosts.iter().all(|r| r.commands_failed == 0));
}

#[tokio::test]
async fn test_command_timeout_counts_as_failed_command() {
    let provider = ScriptedProvider::new(Script {
        delay: Duration::from_secs(30),
        ..Default::default()
    });
    let mut settings = settings(1, &["sleep 30"]);
    settings.command_timeout = Some(Duration::from_millis(20));

    let (summary, _) = run(&provider, settings, vec!["slow".to_string()]).await;

    let report = &summary.hosts[0];
    assert_eq!(report.outcome, HostOutcome::Success);
    assert_eq!(report.commands_failed, 1);
}

#[tokio::test]
async fn test_panicking_worker_is_counted_failed() {
    let provider = ScriptedProvider::new(Script {
        panic_hosts: HashSet::from(["boom".to_string()]),
        ..Default::default()
    });

    let (summary, _) = run(
        &provider,
        settings(1, &["uptime"]),
        vec!["boom".to_string(), "fine".to_string()],
    )
    .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.hosts.len(), 1);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_panicking_worker_halts_fail_batch() {
    let provider = ScriptedProvider::new(Script {
        panic_hosts: HashSet::from(["boom".to_string()]),
        ..Default::default()
    });
    let mut settings = settings(1, &["uptime"]);
    settings.fail_batch = true;
    let raw = vec![
        "boom".to_string(),
        "next-01".to_string(),
        "next-02".to_string(),
        "next-03".to_string(),
    ];

    let (summary, _) = run(&provider, settings, raw).await;

    assert_eq!(summary.failed, 1);
    // the slot freed by the panic can go to one more host before it is reaped
    assert!(summary.success <= 1, "{:?}", summary);
    assert!(summary.skipped >= 2, "{:?}", summary);
    assert_eq!(provider.dials("next-03"), 0);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let provider = ScriptedProvider::new(Script {
        delay: Duration::from_secs(30),
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let (sink, _buffer) = OutputSink::memory();
    let dispatcher = Dispatcher::new(settings(2, &["sleep 30"]), provider.clone())
        .with_sink(sink)
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(hosts(6)))
        .await
        .expect("cancelled run must finish promptly");

    assert!(summary.cancelled);
    assert_eq!(summary.success, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 4);
    assert_accounted(&summary);
    assert_eq!(provider.counters.open.load(Ordering::SeqCst), 0);
}
