//! Paste clipboard images into whichever host a terminal is attached to.
//!
//! Given a decoded clipboard image and a terminal process id, the engine
//! determines whether that terminal runs a local shell or proxies an SSH
//! session, hands back a destination path immediately, and moves the bytes
//! to a remote host in the background when one is involved.

pub mod paste;

pub use paste::config::EngineConfig;
pub use paste::coordinator::TransferCoordinator;
pub use paste::payload::ImagePayload;
pub use paste::types::{
    CompletionEvent, ConnectionIdentity, TerminalContext, TransferOutcome,
};
