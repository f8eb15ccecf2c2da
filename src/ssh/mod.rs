//! russh client plumbing shared by the gateway pool and the SSH adapter.
//!
//! Host keys go through a [`HostKeyVerifier`]; the default accepts any key
//! because jump hosts and targets are trusted by the deployment. Pinning is
//! plugged in by passing a different verifier in [`ConnectOptions`].

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::model::{AuthMethod, Credential};

#[derive(Debug, Error)]
pub enum SshError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },
    #[error("dial {0} timed out")]
    Timeout(String),
    #[error("ssh: {0}")]
    Protocol(#[from] russh::Error),
    #[error("key: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("authentication rejected for {0}")]
    AuthRejected(String),
    #[error("host key for {0} rejected")]
    HostKey(String),
    #[error("channel: {0}")]
    Channel(String),
}

/// Decides whether a server host key is acceptable.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool;
}

pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        debug!(
            "Accepting {} host key for {host}:{port}",
            key.algorithm().as_str()
        );
        true
    }
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub verifier: Arc<dyn HostKeyVerifier>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            keepalive: Some(Duration::from_secs(30)),
            verifier: Arc::new(AcceptAnyHostKey),
        }
    }
}

pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.verifier.verify(&self.host, self.port, server_public_key) {
            Ok(true)
        } else {
            warn!("Host key for {}:{} rejected", self.host, self.port);
            Err(SshError::HostKey(format!("{}:{}", self.host, self.port)))
        }
    }
}

pub type SshHandle = Handle<ClientHandler>;

/// `host:port` with IPv6 literals bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Dial, handshake and authenticate.
pub async fn connect(
    host: &str,
    port: u16,
    cred: &Credential,
    opts: &ConnectOptions,
) -> Result<SshHandle, SshError> {
    let addr = join_host_port(host, port);
    let stream = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| SshError::Timeout(addr.clone()))?
        .map_err(|source| SshError::Dial {
            addr: addr.clone(),
            source,
        })?;
    let _ = stream.set_nodelay(true);

    let config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: opts.keepalive,
        keepalive_max: 3,
        ..Default::default()
    };
    let handler = ClientHandler {
        host: host.to_string(),
        port,
        verifier: Arc::clone(&opts.verifier),
    };

    let mut handle = tokio::time::timeout(
        opts.handshake_timeout,
        client::connect_stream(Arc::new(config), stream, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(addr.clone()))??;

    authenticate(&mut handle, cred).await?;
    debug!("SSH session to {addr} authenticated as {}", cred.user);
    Ok(handle)
}

async fn authenticate(handle: &mut SshHandle, cred: &Credential) -> Result<(), SshError> {
    let result = match cred.method {
        AuthMethod::Password => {
            handle
                .authenticate_password(cred.user.as_str(), cred.password.as_str())
                .await?
        }
        AuthMethod::PublicKey => {
            let phrase = (!cred.phrase.is_empty()).then_some(cred.phrase.as_str());
            let key = russh::keys::decode_secret_key(&cred.pk, phrase)?;
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle.authenticate_publickey(cred.user.as_str(), key).await?
        }
    };
    if result.success() {
        Ok(())
    } else {
        Err(SshError::AuthRejected(cred.user.clone()))
    }
}
