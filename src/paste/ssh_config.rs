//! SSH client configuration lookup and alias resolution.
//!
//! The parser understands the subset of `ssh_config` the resolver needs:
//! `Host` blocks with `HostName`, `User`, `Port` and `IdentityFile`
//! overrides. Matching is exact-token only; glob patterns are skipped, since
//! a glob never names the single endpoint an alias expansion requires.
//!
//! Aliases may chain (`Host a` whose `HostName` is itself an alias).
//! [`resolve_alias`] follows such chains recursively with a depth guard and
//! reports a cycle instead of looping; callers treat that as an unparseable
//! invocation.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Maximum alias-to-alias hops before resolution gives up.
const MAX_ALIAS_DEPTH: usize = 8;

/// Options collected from one `Host` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub host_name: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
}

impl HostConfig {
    /// Fill unset fields from another block. OpenSSH semantics: the first
    /// obtained value for an option wins.
    fn merge_missing_from(&mut self, other: &HostConfig) {
        if self.host_name.is_none() {
            self.host_name = other.host_name.clone();
        }
        if self.user.is_none() {
            self.user = other.user.clone();
        }
        if self.port.is_none() {
            self.port = other.port;
        }
        if self.identity_file.is_none() {
            self.identity_file = other.identity_file.clone();
        }
    }
}

/// Alias-to-endpoint lookup consumed by the invocation parser.
pub trait HostConfigLookup: Send + Sync {
    /// Return the merged options for `alias`, or `None` when no block names
    /// it exactly.
    fn lookup(&self, alias: &str) -> Option<HostConfig>;
}

/// Lookup that knows no aliases. Useful for tests and for hosts without an
/// SSH configuration file.
#[derive(Debug, Default)]
pub struct EmptyLookup;

impl HostConfigLookup for EmptyLookup {
    fn lookup(&self, _alias: &str) -> Option<HostConfig> {
        None
    }
}

/// Parsed SSH client configuration.
///
/// Blocks keep file order; a lookup merges every matching block with
/// first-wins per option, mirroring how OpenSSH applies the file.
#[derive(Debug, Default)]
pub struct SshConfigFile {
    blocks: Vec<(Vec<String>, HostConfig)>,
}

impl SshConfigFile {
    /// Parse configuration text. Unknown keywords and malformed lines are
    /// skipped; this must never fail just because the user's config uses
    /// options this engine does not care about.
    pub fn parse(content: &str) -> Self {
        let mut blocks: Vec<(Vec<String>, HostConfig)> = Vec::new();
        let mut current: Option<(Vec<String>, HostConfig)> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, [' ', '\t', '=']);
            let Some(keyword) = parts.next() else {
                continue;
            };
            let value = parts.next().unwrap_or("").trim();

            if keyword.eq_ignore_ascii_case("host") {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                let patterns = value
                    .split_whitespace()
                    .map(|pattern| pattern.to_string())
                    .collect();
                current = Some((patterns, HostConfig::default()));
                continue;
            }

            let Some((_, options)) = current.as_mut() else {
                // Options before any Host line apply globally; this engine
                // only needs per-alias overrides, so they are ignored.
                continue;
            };

            if keyword.eq_ignore_ascii_case("hostname") {
                options.host_name = Some(value.to_string());
            } else if keyword.eq_ignore_ascii_case("user") {
                options.user = Some(value.to_string());
            } else if keyword.eq_ignore_ascii_case("port") {
                match value.parse() {
                    Ok(port) => options.port = Some(port),
                    Err(_) => warn!("Ignoring unparseable Port value: {}", value),
                }
            } else if keyword.eq_ignore_ascii_case("identityfile") {
                options.identity_file = Some(expand_tilde(value));
            }
        }

        if let Some(block) = current.take() {
            blocks.push(block);
        }

        Self { blocks }
    }

    /// Read and parse a configuration file, returning an empty lookup when
    /// the file is missing or unreadable.
    pub fn from_path(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(err) => {
                debug!("No SSH config at {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    /// Load the user's configuration followed by the system-wide one, in
    /// OpenSSH's order (user options take precedence).
    pub fn load_default() -> Self {
        let mut merged = match home_dir() {
            Some(home) => Self::from_path(&home.join(".ssh").join("config")),
            None => Self::default(),
        };
        let system = Self::from_path(Path::new("/etc/ssh/ssh_config"));
        merged.blocks.extend(system.blocks);
        merged
    }
}

impl HostConfigLookup for SshConfigFile {
    fn lookup(&self, alias: &str) -> Option<HostConfig> {
        let mut merged = HostConfig::default();
        let mut matched = false;

        for (patterns, options) in &self.blocks {
            let hit = patterns
                .iter()
                .filter(|pattern| !pattern.contains(['*', '?', '!']))
                .any(|pattern| pattern == alias);
            if hit {
                matched = true;
                merged.merge_missing_from(options);
            }
        }

        // A bare `Host alias` block with no options still counts as a known
        // alias; it just changes nothing.
        if matched { Some(merged) } else { None }
    }
}

/// Result of expanding an alias into a concrete endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Final hostname after following the alias chain; the original token
    /// when no block matched.
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
}

/// Error from [`resolve_alias`]: the alias chain loops or exceeds the depth
/// guard. Callers downgrade this to "not an SSH invocation".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasCycle {
    pub alias: String,
}

/// Expand `alias` through the configuration, following `HostName` values
/// that are themselves aliases.
///
/// User, port and identity file come from the *first* block in the chain
/// that sets them, matching OpenSSH's first-obtained-value rule.
pub fn resolve_alias(
    lookup: &dyn HostConfigLookup,
    alias: &str,
) -> Result<ResolvedHost, AliasCycle> {
    let mut resolved = ResolvedHost {
        host: alias.to_string(),
        user: None,
        port: None,
        identity_file: None,
    };
    let mut visited = vec![alias.to_string()];

    for _ in 0..MAX_ALIAS_DEPTH {
        let Some(options) = lookup.lookup(&resolved.host) else {
            return Ok(resolved);
        };

        if resolved.user.is_none() {
            resolved.user = options.user.clone();
        }
        if resolved.port.is_none() {
            resolved.port = options.port;
        }
        if resolved.identity_file.is_none() {
            resolved.identity_file = options.identity_file.clone();
        }

        match options.host_name {
            Some(next) if next != resolved.host => {
                if visited.contains(&next) {
                    warn!("SSH alias cycle detected at {}", next);
                    return Err(AliasCycle {
                        alias: alias.to_string(),
                    });
                }
                visited.push(next.clone());
                resolved.host = next;
            }
            // No HostName, or HostName equal to the alias itself: the chain
            // terminates here.
            _ => return Ok(resolved),
        }
    }

    warn!("SSH alias chain from {} exceeds depth limit", alias);
    Err(AliasCycle {
        alias: alias.to_string(),
    })
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
