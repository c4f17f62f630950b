//! russh client handler for background transfer sessions.
//!
//! Transfers reuse whatever SSH session the user already trusts from their
//! interactive shell, so the handler accepts all host keys (the equivalent of
//! `StrictHostKeyChecking=no`). Verifying against known_hosts would be the
//! hardening step for environments where that assumption does not hold.

use russh::{client, keys};

/// Client handler that accepts all server host keys.
pub struct HostKeyAcceptor;

impl client::Handler for HostKeyAcceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
