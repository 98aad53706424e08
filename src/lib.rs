// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Flock: run one command sequence across a fleet of hosts over SSH
//!
//! A recipe names the commands and where the hosts come from. Flock resolves
//! the host list, works out which user to log in as on each host, and
//! dispatches every host to a worker while holding at most `concurrency`
//! sessions open at once. Output from every host is streamed to one shared
//! sink, line by line, tagged with the host it came from.
//!
//! # Features
//!
//! * **Host discovery:** explicit lists or a lookup command, with an optional on-disk cache
//! * **Identity resolution:** per-host users from the ssh client config
//! * **Resilience:** bounded retries with fixed, linear or exponential backoff
//! * **Pluggable transport:** any [`SessionProvider`]; OpenSSH and dry-run ship in-tree

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod hosts;
pub mod identity;
pub mod output;
pub mod recipe;
pub mod retry;
pub mod session;

pub use dispatch::{run_recipe, DispatchSettings, Dispatcher, HostOutcome, HostReport, RunSummary};
pub use error::{FlockError, Result};
pub use hosts::TargetHost;
pub use identity::{UsernameResolver, UsernameTable};
pub use output::OutputSink;
pub use recipe::Recipe;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::{AuthMethod, Session, SessionProvider};
