//! Terminal context resolution with a short-lived cache.
//!
//! [`ContextResolver`] answers "is this terminal local or attached to a
//! remote host" by walking the process tree for SSH client invocations and
//! parsing the first one that names an endpoint. Results are cached per
//! terminal pid with a TTL on the order of a second: long enough that a
//! burst of pastes resolves once, short enough that leaving an SSH session
//! is noticed by the next paste.
//!
//! Resolution never fails. A vanished process, an unreadable table or an
//! unparseable invocation all degrade to [`TerminalContext::Local`]; the
//! interactive path must not block on an error here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::paste::invocation::{ParsedInvocation, parse};
use crate::paste::process::{ProcessSnapshot, find_ssh_ancestors};
use crate::paste::ssh_config::HostConfigLookup;
use crate::paste::types::TerminalContext;

#[derive(Debug, Clone)]
struct CachedResolution {
    context: TerminalContext,
    resolved_at: Instant,
}

/// Resolves a terminal pid to its [`TerminalContext`].
pub struct ContextResolver {
    snapshot: Arc<dyn ProcessSnapshot>,
    lookup: Arc<dyn HostConfigLookup>,
    default_user: String,
    ttl: Duration,
    cache: DashMap<u32, CachedResolution>,
}

impl ContextResolver {
    pub fn new(
        snapshot: Arc<dyn ProcessSnapshot>,
        lookup: Arc<dyn HostConfigLookup>,
        default_user: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            snapshot,
            lookup,
            default_user: default_user.into(),
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Resolve the context for a terminal process, cache-backed.
    ///
    /// A cached entry is honored while its TTL holds *and* the terminal
    /// process still exists; a pid that vanished invalidates eagerly, since
    /// whatever shell produced the entry is gone. Concurrent resolutions of
    /// the same pid race benignly: entries are idempotent functions of OS
    /// state, so last-writer-wins.
    pub fn resolve(&self, terminal_pid: u32) -> TerminalContext {
        if let Some(entry) = self.cache.get(&terminal_pid) {
            let fresh = entry.resolved_at.elapsed() < self.ttl;
            if fresh && self.snapshot.process(terminal_pid).is_some() {
                return entry.context.clone();
            }
        }

        let context = self.resolve_fresh(terminal_pid);
        self.cache.insert(
            terminal_pid,
            CachedResolution {
                context: context.clone(),
                resolved_at: Instant::now(),
            },
        );
        context
    }

    /// Drop the cached entry for a terminal, forcing the next resolve to
    /// walk the process tree again.
    pub fn invalidate(&self, terminal_pid: u32) {
        self.cache.remove(&terminal_pid);
    }

    fn resolve_fresh(&self, terminal_pid: u32) -> TerminalContext {
        for record in find_ssh_ancestors(self.snapshot.as_ref(), terminal_pid) {
            match parse(&record.argv, self.lookup.as_ref(), &self.default_user) {
                ParsedInvocation::Remote(target) => {
                    debug!(
                        pid = terminal_pid,
                        identity = %target.identity,
                        "Terminal resolved to remote context"
                    );
                    return TerminalContext::Remote(target);
                }
                // Candidate did not parse; the next (outer) hop may still.
                ParsedInvocation::NotSsh => continue,
            }
        }
        TerminalContext::Local
    }
}

/// The OS-reported current user, applied when an SSH invocation names none.
pub fn os_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
