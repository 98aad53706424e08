// SPDX-License-Identifier: AGPL-3.0-or-later
//! Login identity resolution
//!
//! Maps a hostname to the user to authenticate as, using the `Host` / `User`
//! blocks of an OpenSSH-style client config. Precedence, first match wins:
//!
//! 1. the first specific `Host` pattern matching the hostname
//! 2. a wildcard-all `Host *` entry
//! 3. the invoking local user
//! 4. the configured fallback identity

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FlockError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyRun,
    AnyOne,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// A compiled `Host` glob: `*`, `?`, `[...]` classes and `\` escapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    source: String,
    tokens: Vec<Token>,
}

impl HostPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let fail = |message: &str| FlockError::SshConfigPattern {
            pattern: pattern.to_string(),
            message: message.to_string(),
        };

        if pattern.is_empty() {
            return Err(fail("empty pattern"));
        }

        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '?' => tokens.push(Token::AnyOne),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| fail("trailing escape"))?;
                    tokens.push(Token::Literal(escaped));
                }
                '[' => {
                    let negated = matches!(chars.peek(), Some('!') | Some('^'));
                    if negated {
                        chars.next();
                    }
                    let mut ranges = Vec::new();
                    let mut closed = false;
                    while let Some(start) = chars.next() {
                        if start == ']' && !ranges.is_empty() {
                            closed = true;
                            break;
                        }
                        if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                Some(']') => {
                                    ranges.push((start, start));
                                    ranges.push(('-', '-'));
                                    closed = true;
                                    break;
                                }
                                Some(end) if end >= start => ranges.push((start, end)),
                                Some(_) => return Err(fail("inverted character range")),
                                None => break,
                            }
                        } else {
                            ranges.push((start, start));
                        }
                    }
                    if !closed {
                        return Err(fail("unclosed character class"));
                    }
                    tokens.push(Token::Class { negated, ranges });
                }
                other => tokens.push(Token::Literal(other)),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether this is the wildcard-all pattern `*`
    pub fn is_wildcard_all(&self) -> bool {
        self.tokens == [Token::AnyRun]
    }

    pub fn matches(&self, hostname: &str) -> bool {
        let text: Vec<char> = hostname.chars().collect();
        match_tokens(&self.tokens, &text)
    }
}

/// Greedy match remembering only the most recent `*`; linear in practice,
/// `O(tokens * text)` worst case.
fn match_tokens(tokens: &[Token], text: &[char]) -> bool {
    let (mut t, mut s) = (0, 0);
    // (token after the last `*`, text position that `*` currently ends at)
    let mut star: Option<(usize, usize)> = None;

    while s < text.len() {
        match tokens.get(t) {
            Some(Token::AnyRun) => {
                t += 1;
                star = Some((t, s));
            }
            Some(token) if token.matches_char(text[s]) => {
                t += 1;
                s += 1;
            }
            _ => match star {
                Some((resume, end)) => {
                    t = resume;
                    s = end + 1;
                    star = Some((resume, end + 1));
                }
                None => return false,
            },
        }
    }

    tokens[t..].iter().all(|token| *token == Token::AnyRun)
}

impl Token {
    fn matches_char(&self, c: char) -> bool {
        match self {
            Token::Literal(expected) => *expected == c,
            Token::AnyOne => true,
            Token::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
            }
            Token::AnyRun => false,
        }
    }
}

/// One `Host` pattern bound to the user of its block
#[derive(Debug, Clone)]
pub struct HostUserEntry {
    pub pattern: HostPattern,
    pub user: String,
    /// Negated (`!pattern`) patterns from the same `Host` line
    pub excluded: Vec<HostPattern>,
}

impl HostUserEntry {
    fn matches(&self, hostname: &str) -> bool {
        self.pattern.matches(hostname) && !self.excluded.iter().any(|p| p.matches(hostname))
    }
}

/// Ordered (pattern, user) table built once from an ssh client config
#[derive(Debug, Clone, Default)]
pub struct UsernameTable {
    entries: Vec<HostUserEntry>,
}

impl UsernameTable {
    /// Build a table from literal (pattern, user) pairs
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let entries = pairs
            .into_iter()
            .map(|(pattern, user)| {
                Ok(HostUserEntry {
                    pattern: HostPattern::compile(pattern)?,
                    user: user.to_string(),
                    excluded: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Parse the `Host` and `User` directives of an ssh client config.
    ///
    /// Blocks without a `User` contribute nothing. A `User` before the first
    /// `Host` acts like `Host *`. `Match` blocks are skipped. A pattern that
    /// does not compile is an error.
    pub fn parse(contents: &str) -> Result<Self> {
        struct Block {
            patterns: Vec<String>,
            user: Option<String>,
        }

        let mut blocks = vec![Block {
            patterns: vec!["*".to_string()],
            user: None,
        }];
        let mut in_match = false;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, args) = split_directive(line);
            match keyword.to_ascii_lowercase().as_str() {
                "host" => {
                    in_match = false;
                    blocks.push(Block {
                        patterns: args.split_whitespace().map(unquote).collect(),
                        user: None,
                    });
                }
                "match" => in_match = true,
                "user" if !in_match => {
                    if let Some(block) = blocks.last_mut() {
                        // The first obtained value wins, as in ssh itself.
                        if block.user.is_none() {
                            block.user = Some(unquote(args.trim()));
                        }
                    }
                }
                "include" => debug!(target_file = %args, "Include directives are not followed"),
                _ => {}
            }
        }

        let mut entries = Vec::new();
        for block in blocks {
            let Some(user) = block.user.filter(|u| !u.is_empty()) else {
                continue;
            };

            let mut excluded = Vec::new();
            let mut positive = Vec::new();
            for pattern in &block.patterns {
                match pattern.strip_prefix('!') {
                    Some(negated) => excluded.push(HostPattern::compile(negated)?),
                    None => positive.push(HostPattern::compile(pattern)?),
                }
            }

            for pattern in positive {
                entries.push(HostUserEntry {
                    pattern,
                    user: user.clone(),
                    excluded: excluded.clone(),
                });
            }
        }

        Ok(Self { entries })
    }

    /// Load a config file; a missing or unreadable file yields an empty table
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read ssh config; no host user mappings");
                Ok(Self::default())
            }
        }
    }

    pub fn entries(&self) -> &[HostUserEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// User from the table alone: specific patterns first, then `*`
    pub fn lookup(&self, hostname: &str) -> Option<&str> {
        let specific = self
            .entries
            .iter()
            .filter(|e| !e.pattern.is_wildcard_all())
            .find(|e| e.matches(hostname));
        let wildcard = || {
            self.entries
                .iter()
                .filter(|e| e.pattern.is_wildcard_all())
                .find(|e| e.matches(hostname))
        };
        specific.or_else(wildcard).map(|e| e.user.as_str())
    }
}

fn split_directive(line: &str) -> (&str, &str) {
    let split_at = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(split_at);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    (keyword, rest.trim())
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

/// `~/.ssh/config` for the invoking user
pub fn default_ssh_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh").join("config"))
}

/// The invoking user's login name: the account database first, then
/// `$USER` / `$LOGNAME`
pub fn local_username() -> Option<String> {
    let account = match whoami::fallible::username() {
        Ok(name) => Some(name),
        Err(e) => {
            debug!(error = %e, "Account lookup for the local user failed");
            None
        }
    };
    first_username(
        std::iter::once(account)
            .chain(["USER", "LOGNAME"].iter().map(|key| std::env::var(key).ok())),
    )
}

fn first_username<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

/// Resolves the identity to log in as for each host
#[derive(Debug, Clone)]
pub struct UsernameResolver {
    table: UsernameTable,
    local_user: Option<String>,
    fallback_user: String,
}

impl UsernameResolver {
    pub fn new(
        table: UsernameTable,
        local_user: Option<String>,
        fallback_user: impl Into<String>,
    ) -> Self {
        Self {
            table,
            local_user,
            fallback_user: fallback_user.into(),
        }
    }

    /// Resolver backed by the local user from the environment
    pub fn from_environment(table: UsernameTable, fallback_user: impl Into<String>) -> Self {
        let local_user = local_username();
        let fallback_user = fallback_user.into();
        if local_user.is_none() {
            warn!(fallback = %fallback_user, "Couldn't get username for local user");
        }
        Self::new(table, local_user, fallback_user)
    }

    /// User to authenticate as for `host`; a `:port` suffix is ignored
    pub fn resolve(&self, host: &str) -> String {
        let hostname = strip_port(host);
        self.table
            .lookup(hostname)
            .or(self.local_user.as_deref())
            .unwrap_or(&self.fallback_user)
            .to_string()
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inner, _)) = rest.split_once(']') {
            return inner;
        }
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}
