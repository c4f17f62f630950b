//! Terminal-context resolution and asynchronous transfer coordination.
//!
//! This module is organized into the following submodules:
//!
//! - `types`, `payload`: data model (identities, contexts, jobs, payloads)
//! - `config`: configuration resolution with environment variable support
//! - `error`: failure taxonomy and retry classification
//! - `process`, `ssh_config`, `invocation`, `resolver`: terminal context
//!   resolution from the process tree and SSH client configuration
//! - `session`, `auth`, `client`, `pool`: authenticated SSH transports and
//!   their pooling
//! - `dedup`, `coordinator`: the background transfer pipeline

pub mod auth;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod invocation;
pub mod payload;
pub mod pool;
pub mod process;
pub mod resolver;
pub mod session;
pub mod ssh_config;
pub mod types;

pub use coordinator::TransferCoordinator;
