//! SSH command-line parsing.
//!
//! Turns the argument vector of a running `ssh` process into a canonical
//! [`RemoteTarget`]. Handles `user@host` destinations, `-l user`, `-p port`,
//! `-i identity_file` (separated or attached forms), and bare alias
//! destinations expanded through the SSH client configuration.
//!
//! Anything that cannot be understood yields [`ParsedInvocation::NotSsh`]:
//! an unparseable command line means "this hop is not remote", never an
//! error that could block the interactive path.

use crate::paste::ssh_config::{HostConfigLookup, resolve_alias};
use crate::paste::types::{ConnectionIdentity, RemoteTarget};

/// Outcome of parsing one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInvocation {
    /// A recognized SSH client invocation targeting this endpoint.
    Remote(RemoteTarget),
    /// Not an SSH invocation (or one this parser cannot make sense of).
    NotSsh,
}

/// OpenSSH flags that consume the following argument. Skipped without
/// interpretation unless listed in the match below.
const FLAGS_WITH_ARG: &[&str] = &[
    "-B", "-b", "-c", "-D", "-E", "-e", "-F", "-I", "-i", "-J", "-L", "-l", "-m", "-O", "-o",
    "-P", "-p", "-Q", "-R", "-S", "-W", "-w",
];

/// Parse an SSH invocation's argument vector.
///
/// `default_user` is the OS-reported current user, applied when neither the
/// command line nor the configuration names one. Command-line values always
/// beat configuration values; configuration fills the gaps; port defaults
/// to 22 last.
pub fn parse(
    argv: &[String],
    lookup: &dyn HostConfigLookup,
    default_user: &str,
) -> ParsedInvocation {
    let Some(first) = argv.first() else {
        return ParsedInvocation::NotSsh;
    };
    let basename = std::path::Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    if basename != "ssh" {
        return ParsedInvocation::NotSsh;
    }

    let mut cli_user: Option<String> = None;
    let mut cli_port: Option<u16> = None;
    let mut cli_identity: Option<String> = None;
    let mut destination: Option<String> = None;

    let mut index = 1;
    while index < argv.len() {
        let arg = &argv[index];

        if let Some(value) = flag_value(argv, &mut index, "-l") {
            cli_user = Some(value);
            continue;
        }
        if let Some(value) = flag_value(argv, &mut index, "-p") {
            match value.parse() {
                Ok(port) => cli_port = Some(port),
                // ssh itself would have refused to start with a bad port;
                // a running process with one is not something we can name.
                Err(_) => return ParsedInvocation::NotSsh,
            }
            continue;
        }
        if let Some(value) = flag_value(argv, &mut index, "-i") {
            cli_identity = Some(value);
            continue;
        }

        if arg.starts_with('-') {
            if FLAGS_WITH_ARG.contains(&arg.as_str()) {
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }

        // First non-flag argument is the destination; the rest is a remote
        // command and irrelevant to where the session points.
        destination = Some(arg.clone());
        break;
    }

    let Some(destination) = destination else {
        return ParsedInvocation::NotSsh;
    };

    // Split an inline user off the destination before alias expansion: the
    // part after `@` may still be an alias.
    let (at_user, host_token) = match destination.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => {
            (Some(user.to_string()), host.to_string())
        }
        Some(_) => return ParsedInvocation::NotSsh,
        None => (None, destination),
    };

    let Ok(resolved) = resolve_alias(lookup, &host_token) else {
        // Alias cycle: treat the invocation as unparseable.
        return ParsedInvocation::NotSsh;
    };

    let user = cli_user
        .or(at_user)
        .or(resolved.user)
        .unwrap_or_else(|| default_user.to_string());
    let port = cli_port.or(resolved.port);
    let identity_file = cli_identity.or(resolved.identity_file);

    ParsedInvocation::Remote(RemoteTarget {
        identity: ConnectionIdentity::new(user, resolved.host, port),
        identity_file,
    })
}

/// Match `flag` at the current position in either separated (`-p 22`) or
/// attached (`-p22`) form, advancing the index past what was consumed.
fn flag_value(argv: &[String], index: &mut usize, flag: &str) -> Option<String> {
    let arg = &argv[*index];
    if arg == flag {
        let value = argv.get(*index + 1)?.clone();
        *index += 2;
        Some(value)
    } else if let Some(rest) = arg.strip_prefix(flag)
        && !rest.is_empty()
    {
        *index += 1;
        Some(rest.to_string())
    } else {
        None
    }
}
