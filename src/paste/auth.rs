//! SSH authentication strategies for background transfer connections.
//!
//! A transfer session authenticates the same way the user's interactive
//! session would: the identity file named by the SSH invocation (or its
//! alias block) first, then the standard key files under `~/.ssh`, then the
//! SSH agent. Each method is an [`AuthStrategy`]; [`AuthChain`] tries them
//! in order and stops at the first success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::paste::session::HostKeyAcceptor;
use crate::paste::ssh_config::home_dir;
use crate::paste::types::RemoteTarget;

/// Key files tried, in order, when the invocation names no identity file.
const DEFAULT_KEY_NAMES: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519"];

/// One SSH authentication method.
///
/// `Ok(true)` means the server accepted the credentials, `Ok(false)` means
/// it rejected them, and `Err` carries a failure while attempting (missing
/// key file, no agent socket). Implementations must be `Send + Sync` so a
/// chain can be shared across worker tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<HostKeyAcceptor>,
        username: &str,
    ) -> Result<bool, String>;

    /// Strategy name for logging.
    fn name(&self) -> &'static str;
}

/// Password authentication.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<HostKeyAcceptor>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Private key file authentication. Supports passphrase-less keys.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<HostKeyAcceptor>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = keys::load_secret_key(Path::new(&self.key_path), None)
            .map_err(|e| format!("Failed to load private key from {:?}: {}", self.key_path, e))?;

        // RSA keys need the server's preferred hash algorithm.
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// SSH agent authentication: connects via `SSH_AUTH_SOCK` and tries every
/// identity the agent holds.
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<HostKeyAcceptor>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to get identities from SSH agent: {}", e))?;

        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Agent authentication error: {}, trying next identity", e);
                    continue;
                }
            }
        }

        Err("Agent authentication failed: no identities accepted".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Ordered sequence of authentication strategies.
///
/// The first strategy the server accepts wins. When every strategy fails,
/// the last failure message is reported.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_path)));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Build the chain for a resolved remote target.
    ///
    /// The invocation's identity file (from `-i` or the alias's
    /// `IdentityFile`) takes priority. Without one, the default key files
    /// that exist on disk are tried, and the agent closes the chain either
    /// way.
    pub fn for_target(target: &RemoteTarget) -> Self {
        let mut chain = Self::new();

        if let Some(identity_file) = &target.identity_file {
            chain = chain.with_key(identity_file);
        } else if let Some(home) = home_dir() {
            for name in DEFAULT_KEY_NAMES {
                let path = home.join(".ssh").join(name);
                if path.exists() {
                    chain = chain.with_key(path);
                }
            }
        }

        chain.with_agent()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<HostKeyAcceptor>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
