//! Core data model for terminal-context resolution and background transfers.
//!
//! The types here are shared by every stage of the pipeline: the resolver
//! produces a [`TerminalContext`], the coordinator turns a remote context
//! into a [`TransferJob`], and workers report [`CompletionEvent`]s as jobs
//! reach a terminal state.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paste::payload::ImagePayload;

/// Canonical identity of a remote endpoint.
///
/// Two SSH sessions with the same `(user, host, port)` triple are treated as
/// the same logical target even when they are separate OS processes. Aliases
/// from the SSH client configuration are expanded *before* an identity is
/// constructed, so `ssh myserver` and `ssh user@host.example.com -p 2222`
/// can hash to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionIdentity {
    /// Create an identity, applying the default SSH port when none is given.
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: port.unwrap_or(DEFAULT_SSH_PORT),
        }
    }
}

impl std::fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Default SSH port used when neither the command line nor the client
/// configuration specifies one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A fully resolved remote target: the canonical identity plus the
/// credential hint extracted from the SSH invocation or its alias block.
///
/// The identity file is deliberately not part of [`ConnectionIdentity`]:
/// dedup and pooling key on *where* bytes go, not on how the session
/// authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub identity: ConnectionIdentity,
    /// Private key path from `-i` or the alias's `IdentityFile`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl RemoteTarget {
    pub fn new(identity: ConnectionIdentity) -> Self {
        Self {
            identity,
            identity_file: None,
        }
    }
}

/// What a terminal process is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalContext {
    /// The terminal runs a local shell; pasted files stay on this machine.
    Local,
    /// The terminal proxies an SSH session to the given target.
    Remote(RemoteTarget),
}

impl TerminalContext {
    pub fn is_remote(&self) -> bool {
        matches!(self, TerminalContext::Remote(_))
    }
}

/// Key identifying one logical transfer: a content hash bound to a remote
/// identity. Used by the dedup cache and the in-flight index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub identity: ConnectionIdentity,
    pub content_hash: String,
}

impl JobKey {
    pub fn new(identity: ConnectionIdentity, content_hash: impl Into<String>) -> Self {
        Self {
            identity,
            content_hash: content_hash.into(),
        }
    }
}

/// Lifecycle state of a background transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Queued,
    /// A worker is checking whether the destination already holds the bytes.
    Probing,
    /// Bytes are being written to the destination path.
    Uploading,
    /// Terminal: the destination path holds the bytes.
    Completed,
    /// A retryable failure occurred; the job is headed back to the queue.
    Failed,
    /// Terminal: attempts exhausted or a non-retryable error occurred.
    Aborted,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Probing => write!(f, "probing"),
            JobState::Uploading => write!(f, "uploading"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a job reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Bytes were written to the destination.
    Uploaded,
    /// The destination already held identical content; no bytes moved.
    Skipped,
    /// The job aborted; the destination path was never realized.
    Failed,
}

impl std::fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferOutcome::Uploaded => write!(f, "uploaded"),
            TransferOutcome::Skipped => write!(f, "skipped"),
            TransferOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// A background transfer moving one payload to one destination path.
///
/// Jobs are exclusively owned: the coordinator hands a job to a single
/// worker, and only that worker mutates it until the job reaches a terminal
/// state or re-enters the queue. The destination path is fixed at creation
/// and never rewritten afterwards.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: String,
    pub target: RemoteTarget,
    pub payload: ImagePayload,
    pub destination: String,
    pub state: JobState,
    /// Processing attempts consumed so far.
    pub attempts: u32,
    pub created_at: DateTime<Local>,
}

impl TransferJob {
    pub fn new(target: RemoteTarget, payload: ImagePayload, destination: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            payload,
            destination,
            state: JobState::Queued,
            attempts: 0,
            created_at: Local::now(),
        }
    }

    /// The dedup/in-flight key this job transfers under.
    pub fn key(&self) -> JobKey {
        JobKey::new(self.target.identity.clone(), self.payload.content_hash())
    }
}

/// Event emitted once per job when it reaches a terminal state.
///
/// The interactive path has long since returned by the time this fires; the
/// notification collaborator decides whether and how to surface it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Unique identifier of the finished job.
    pub job_id: String,
    /// The exact path handed to the caller at submit time.
    pub destination: String,
    /// Remote endpoint the job targeted.
    pub identity: ConnectionIdentity,
    pub outcome: TransferOutcome,
    /// Failure reason, present only when `outcome` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of processing attempts the job consumed.
    pub attempts: u32,
    /// When the job finished (RFC3339 format).
    pub finished_at: String,
}
