//! Process-tree introspection for terminal context resolution.
//!
//! Given a terminal's shell pid, [`find_ssh_ancestors`] walks the parent
//! chain looking for SSH client invocations and falls back to a scan of the
//! whole process table filtered by controlling terminal. The walk is a pure
//! function over a [`ProcessSnapshot`], so tests supply a fabricated table
//! instead of a live `/proc`.
//!
//! Lookups fail softly throughout: a process that exits mid-walk, or one we
//! lack permission to read, is skipped rather than propagated. The walker
//! must tolerate a racing shell.

use std::path::Path;

use tracing::trace;

/// Upper bound on the parent-chain walk. Process trees deeper than this are
/// either containers gone wild or a ppid cycle from pid reuse.
const MAX_WALK_DEPTH: usize = 32;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    /// Full argument vector; empty for kernel threads.
    pub argv: Vec<String>,
    /// Process start time in clock ticks since boot (`/proc/{pid}/stat`
    /// field 22). Later starts mean more recently spawned.
    pub start_time: u64,
    /// Controlling terminal device number (`stat` field 7), 0 when none.
    pub tty_nr: i32,
}

impl ProcessRecord {
    /// Whether this record is an SSH *client* invocation.
    ///
    /// Matches on the executable basename so `/usr/bin/ssh` and `ssh` both
    /// qualify while `sshd`, `ssh-agent`, `sftp` and `scp` do not.
    pub fn is_ssh_client(&self) -> bool {
        let Some(first) = self.argv.first() else {
            return false;
        };
        let basename = Path::new(first)
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        basename == "ssh"
    }
}

/// A point-in-time view of the process table.
///
/// The production implementation reads `/proc` on demand; tests implement
/// this over a plain vector.
pub trait ProcessSnapshot: Send + Sync {
    /// Look up a single process, `None` if it does not exist or cannot be
    /// read.
    fn process(&self, pid: u32) -> Option<ProcessRecord>;

    /// Enumerate every readable process.
    fn processes(&self) -> Vec<ProcessRecord>;
}

/// Find the SSH client invocations associated with a terminal process.
///
/// Primary strategy: walk `terminal_pid`'s parent chain up to the session
/// leader, collecting SSH clients innermost-first. Fallback when the chain
/// holds none: scan the whole table for SSH clients sharing the terminal's
/// controlling tty, most recently spawned first (a nested `ssh` hop is the
/// active one).
pub fn find_ssh_ancestors(
    snapshot: &dyn ProcessSnapshot,
    terminal_pid: u32,
) -> Vec<ProcessRecord> {
    let mut found = Vec::new();
    let mut current = snapshot.process(terminal_pid);
    let terminal_tty = current.as_ref().map(|record| record.tty_nr);

    let mut depth = 0;
    while let Some(record) = current {
        if record.is_ssh_client() {
            trace!(pid = record.pid, "ssh client found in ancestor chain");
            found.push(record.clone());
        }

        depth += 1;
        if depth >= MAX_WALK_DEPTH || record.ppid == 0 || record.ppid == record.pid {
            break;
        }
        current = snapshot.process(record.ppid);
    }

    if !found.is_empty() {
        return found;
    }

    // Fallback: whole-table scan filtered by controlling terminal.
    let mut candidates: Vec<ProcessRecord> = snapshot
        .processes()
        .into_iter()
        .filter(|record| record.is_ssh_client())
        .filter(|record| match terminal_tty {
            Some(tty) if tty != 0 => record.tty_nr == tty,
            _ => true,
        })
        .collect();
    candidates.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    candidates
}

/// `/proc`-backed process snapshot.
///
/// Each lookup re-reads the filesystem, which is what the short resolver
/// cache TTL assumes: a fresh resolution sees the current tree, not a stale
/// scan from seconds ago.
#[derive(Debug, Default)]
pub struct ProcfsSnapshot;

impl ProcfsSnapshot {
    pub fn new() -> Self {
        Self
    }

    fn read_record(pid: u32) -> Option<ProcessRecord> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let (ppid, tty_nr, start_time) = parse_stat(&stat)?;

        let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).unwrap_or_default();
        let argv: Vec<String> = cmdline
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();

        Some(ProcessRecord {
            pid,
            ppid,
            argv,
            start_time,
            tty_nr,
        })
    }
}

impl ProcessSnapshot for ProcfsSnapshot {
    fn process(&self, pid: u32) -> Option<ProcessRecord> {
        Self::read_record(pid)
    }

    fn processes(&self) -> Vec<ProcessRecord> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<u32>().ok())
            .filter_map(Self::read_record)
            .collect()
    }
}

/// Extract `(ppid, tty_nr, start_time)` from a `/proc/{pid}/stat` line.
///
/// The comm field (2) is parenthesized and may itself contain spaces or
/// parentheses, so fields are counted from the *last* closing parenthesis.
fn parse_stat(stat: &str) -> Option<(u32, i32, u64)> {
    let close = stat.rfind(')')?;
    let rest = stat.get(close + 1..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // After comm: fields[0] is state (3), [1] ppid (4), [4] tty_nr (7),
    // [19] starttime (22).
    let ppid = fields.get(1)?.parse().ok()?;
    let tty_nr = fields.get(4)?.parse().ok()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some((ppid, tty_nr, start_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Snapshot over a fixed vector of records.
    pub(crate) struct FakeSnapshot {
        records: Vec<ProcessRecord>,
    }

    impl FakeSnapshot {
        pub(crate) fn new(records: Vec<ProcessRecord>) -> Self {
            Self { records }
        }
    }

    impl ProcessSnapshot for FakeSnapshot {
        fn process(&self, pid: u32) -> Option<ProcessRecord> {
            self.records.iter().find(|record| record.pid == pid).cloned()
        }

        fn processes(&self) -> Vec<ProcessRecord> {
            self.records.clone()
        }
    }

    pub(crate) fn record(pid: u32, ppid: u32, argv: &[&str]) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            start_time: u64::from(pid),
            tty_nr: 34816,
        }
    }

    mod ssh_client_detection {
        use super::*;

        #[test]
        fn test_bare_ssh_matches() {
            assert!(record(1, 0, &["ssh", "host"]).is_ssh_client());
        }

        #[test]
        fn test_absolute_path_matches() {
            assert!(record(1, 0, &["/usr/bin/ssh", "host"]).is_ssh_client());
        }

        #[test]
        fn test_sshd_does_not_match() {
            assert!(!record(1, 0, &["/usr/sbin/sshd", "-D"]).is_ssh_client());
        }

        #[test]
        fn test_ssh_agent_does_not_match() {
            assert!(!record(1, 0, &["ssh-agent", "-s"]).is_ssh_client());
        }

        #[test]
        fn test_scp_and_sftp_do_not_match() {
            assert!(!record(1, 0, &["scp", "a", "b:c"]).is_ssh_client());
            assert!(!record(1, 0, &["sftp", "host"]).is_ssh_client());
        }

        #[test]
        fn test_empty_argv_does_not_match() {
            assert!(!record(1, 0, &[]).is_ssh_client());
        }
    }

    mod ancestor_walk {
        use super::*;

        #[test]
        fn test_no_ssh_in_chain_returns_empty_when_no_tty_match() {
            let snapshot = FakeSnapshot::new(vec![
                record(100, 1, &["/sbin/init"]),
                record(200, 100, &["zsh"]),
            ]);
            assert!(find_ssh_ancestors(&snapshot, 200).is_empty());
        }

        #[test]
        fn test_direct_parent_ssh_found() {
            let snapshot = FakeSnapshot::new(vec![
                record(100, 1, &["zsh"]),
                record(200, 100, &["ssh", "user@host"]),
                record(300, 200, &["bash"]),
            ]);
            let found = find_ssh_ancestors(&snapshot, 300);
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].pid, 200);
        }

        #[test]
        fn test_nested_sessions_innermost_first() {
            let snapshot = FakeSnapshot::new(vec![
                record(10, 1, &["zsh"]),
                record(20, 10, &["ssh", "hop1"]),
                record(30, 20, &["bash"]),
                record(40, 30, &["ssh", "hop2"]),
                record(50, 40, &["bash"]),
            ]);
            let found = find_ssh_ancestors(&snapshot, 50);
            let pids: Vec<u32> = found.iter().map(|r| r.pid).collect();
            assert_eq!(pids, vec![40, 20]);
        }

        #[test]
        fn test_missing_pid_yields_whole_table_fallback() {
            let snapshot = FakeSnapshot::new(vec![record(20, 1, &["ssh", "host"])]);
            // pid 999 does not exist; the scan cannot filter by tty so it
            // returns every ssh client it can see.
            let found = find_ssh_ancestors(&snapshot, 999);
            assert_eq!(found.len(), 1);
        }

        #[test]
        fn test_walk_stops_on_self_parent() {
            // A record whose ppid equals its own pid must not loop forever.
            let snapshot = FakeSnapshot::new(vec![ProcessRecord {
                pid: 7,
                ppid: 7,
                argv: vec!["zsh".to_string()],
                start_time: 1,
                tty_nr: 0,
            }]);
            assert!(find_ssh_ancestors(&snapshot, 7).is_empty());
        }
    }

    mod table_fallback {
        use super::*;

        fn with_tty(mut r: ProcessRecord, tty: i32) -> ProcessRecord {
            r.tty_nr = tty;
            r
        }

        #[test]
        fn test_fallback_filters_by_controlling_tty() {
            let snapshot = FakeSnapshot::new(vec![
                with_tty(record(100, 1, &["zsh"]), 5),
                with_tty(record(200, 1, &["ssh", "same-tty"]), 5),
                with_tty(record(300, 1, &["ssh", "other-tty"]), 9),
            ]);
            let found = find_ssh_ancestors(&snapshot, 100);
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].argv[1], "same-tty");
        }

        #[test]
        fn test_fallback_orders_by_start_time_descending() {
            let newer = ProcessRecord {
                start_time: 900,
                ..with_tty(record(200, 1, &["ssh", "newer"]), 5)
            };
            let older = ProcessRecord {
                start_time: 100,
                ..with_tty(record(300, 1, &["ssh", "older"]), 5)
            };
            let snapshot = FakeSnapshot::new(vec![
                with_tty(record(100, 1, &["zsh"]), 5),
                older,
                newer,
            ]);
            let found = find_ssh_ancestors(&snapshot, 100);
            assert_eq!(found[0].argv[1], "newer");
            assert_eq!(found[1].argv[1], "older");
        }
    }

    mod stat_parsing {
        use super::*;

        #[test]
        fn test_plain_comm() {
            let stat = "1234 (zsh) S 1000 1234 1234 34816 1234 4194304 1 0 0 0 0 0 0 0 20 0 1 0 555 0 0";
            let (ppid, tty_nr, start_time) = parse_stat(stat).unwrap();
            assert_eq!(ppid, 1000);
            assert_eq!(tty_nr, 34816);
            assert_eq!(start_time, 555);
        }

        #[test]
        fn test_comm_with_spaces_and_parens() {
            let stat = "42 (tmux: client (1)) S 7 42 42 34817 42 0 1 0 0 0 0 0 0 0 20 0 1 0 777 0 0";
            let (ppid, tty_nr, start_time) = parse_stat(stat).unwrap();
            assert_eq!(ppid, 7);
            assert_eq!(tty_nr, 34817);
            assert_eq!(start_time, 777);
        }

        #[test]
        fn test_truncated_line_is_none() {
            assert!(parse_stat("1234 (zsh) S 1").is_none());
        }

        #[test]
        fn test_garbage_is_none() {
            assert!(parse_stat("not a stat line").is_none());
        }
    }
}
