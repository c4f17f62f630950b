//! SSH transport establishment and SFTP file operations.
//!
//! [`Transport`] is the seam between the transfer pipeline and the network:
//! an authenticated session that can probe for a remote file and upload
//! bytes to an exact path. The production implementation runs over russh
//! with an SFTP subsystem channel per operation; tests substitute mocks.
//!
//! Connection establishment retries transient failures with exponential
//! backoff and jitter. Authentication failures are never retried, so a bad
//! credential surfaces immediately instead of locking the account.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::client;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::paste::auth::{AuthChain, AuthStrategy};
use crate::paste::config::{EngineConfig, MAX_RETRY_DELAY};
use crate::paste::error::{TransferError, classify_error_message};
use crate::paste::session::HostKeyAcceptor;
use crate::paste::types::RemoteTarget;

/// Connection attempts per `connect` call beyond the first.
const CONNECT_RETRIES: usize = 2;

/// An authenticated session capable of remote file operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Probe for a remote file. Returns its size when present, `None` when
    /// absent.
    async fn exists(&self, path: &str) -> Result<Option<u64>, TransferError>;

    /// Write `bytes` to exactly `path`, creating missing parent directories
    /// first and verifying the file landed.
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), TransferError>;

    /// Close the underlying session. Best-effort; errors are swallowed.
    async fn close(&mut self);
}

/// Establishes [`Transport`]s for remote targets. The pool calls this when
/// no idle session is available for an identity.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Transport>, TransferError>;
}

/// Build russh client configuration for a pooled transfer session.
///
/// No inactivity timeout: session lifetime is governed by the pool's idle
/// sweep, while keepalives detect half-open connections underneath it.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parent directories of a remote path, shortest first, excluding the root.
///
/// Remote paths are plain `/`-separated strings; running them through the
/// local platform's path logic could rewrite them.
pub(crate) fn parent_dirs(path: &str) -> Vec<String> {
    let Some((parent, _)) = path.rsplit_once('/') else {
        return Vec::new();
    };

    let mut dirs = Vec::new();
    let mut current = String::new();
    for component in parent.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}

/// russh-backed transport: one authenticated session, one SFTP subsystem
/// channel per operation.
pub struct RusshTransport {
    handle: client::Handle<HostKeyAcceptor>,
}

impl RusshTransport {
    async fn open_sftp(&self) -> Result<SftpSession, TransferError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| classify_error_message(&format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                classify_error_message(&format!("Failed to request SFTP subsystem: {}", e))
            })?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| classify_error_message(&format!("Failed to create SFTP session: {}", e)))
    }

    async fn probe(sftp: &SftpSession, path: &str) -> Result<Option<u64>, TransferError> {
        match sftp.try_exists(path).await {
            Ok(true) => match sftp.metadata(path).await {
                Ok(attrs) => Ok(Some(attrs.size.unwrap_or(0))),
                Err(e) => {
                    debug!(path, error = %e, "Exists but metadata unreadable");
                    Ok(Some(0))
                }
            },
            Ok(false) => Ok(None),
            Err(e) => Err(classify_error_message(&format!(
                "Failed to check remote path {}: {}",
                path, e
            ))),
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn exists(&self, path: &str) -> Result<Option<u64>, TransferError> {
        let sftp = self.open_sftp().await?;
        Self::probe(&sftp, path).await
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), TransferError> {
        let sftp = self.open_sftp().await?;

        // mkdir -p; a directory that already exists fails harmlessly.
        for dir in parent_dirs(path) {
            let _ = sftp.create_dir(&dir).await;
        }

        let mut remote_file = sftp.create(path).await.map_err(|e| {
            classify_error_message(&format!("Failed to create remote file {}: {}", path, e))
        })?;

        remote_file.write_all(bytes).await.map_err(|e| {
            classify_error_message(&format!("Failed to write to remote file {}: {}", path, e))
        })?;

        remote_file.shutdown().await.map_err(|e| {
            classify_error_message(&format!("Failed to close remote file {}: {}", path, e))
        })?;

        // Re-probe: a write the server quietly dropped must not be reported
        // as delivered.
        match Self::probe(&sftp, path).await? {
            Some(_) => Ok(()),
            None => Err(TransferError::Connection(format!(
                "Upload verification failed: {} missing after write",
                path
            ))),
        }
    }

    async fn close(&mut self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Factory producing [`RusshTransport`]s with retrying connection
/// establishment.
pub struct RusshTransportFactory {
    connect_timeout: Duration,
    retry_min_delay: Duration,
    compression: bool,
}

impl RusshTransportFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            retry_min_delay: config.retry_delay(),
            compression: config.compression,
        }
    }

    /// Single connection attempt: TCP + handshake under the connect
    /// timeout, then the authentication chain for the target.
    async fn connect_once(
        &self,
        target: &RemoteTarget,
    ) -> Result<client::Handle<HostKeyAcceptor>, TransferError> {
        let config = build_client_config(self.compression);
        let identity = &target.identity;

        let connect_future = client::connect(
            config,
            (identity.host.as_str(), identity.port),
            HostKeyAcceptor,
        );

        let mut handle = tokio::time::timeout(self.connect_timeout, connect_future)
            .await
            .map_err(|_| {
                TransferError::Timeout(format!(
                    "Connection to {} timed out after {:?}",
                    identity, self.connect_timeout
                ))
            })?
            .map_err(|e| classify_error_message(&format!("Failed to connect: {}", e)))?;

        let chain = AuthChain::for_target(target);
        let success = chain
            .authenticate(&mut handle, &identity.user)
            .await
            .map_err(|message| classify_error_message(&message))?;

        if !success {
            return Err(TransferError::Authentication(format!(
                "No authentication method succeeded for {}",
                identity
            )));
        }

        Ok(handle)
    }
}

#[async_trait]
impl TransportFactory for RusshTransportFactory {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Transport>, TransferError> {
        let attempt_counter = AtomicU32::new(0);
        let identity = target.identity.clone();

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_min_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(CONNECT_RETRIES)
            .with_jitter();

        let handle = (|| async {
            let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if attempt > 0 {
                warn!("SSH connection retry attempt {} to {}", attempt, identity);
            }
            self.connect_once(target).await
        })
        .retry(backoff)
        .when(|e: &TransferError| e.is_retryable())
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await?;

        debug!("Established transfer session to {}", target.identity);
        Ok(Box::new(RusshTransport { handle }))
    }
}
