//! Jump-host clients as seen by the tunnel pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::Disconnect;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::TunnelError;
use crate::model::{Credential, Gateway};
use crate::ssh::{self, ConnectOptions, SshHandle};

/// A bidirectional byte stream opened through a gateway.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// One live connection to a jump host.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Open a TCP stream from the jump host to `host:port`.
    async fn open_direct(&self, host: &str, port: u16) -> Result<Box<dyn ByteStream>, TunnelError>;
    /// Resolves once the connection is gone.
    async fn closed(&self);
    async fn close(&self);
}

/// Dials jump hosts.
#[async_trait]
pub trait GatewayDialer: Send + Sync {
    async fn dial(&self, gateway: &Gateway) -> Result<Arc<dyn GatewayClient>, TunnelError>;
}

/// russh-backed dialer.
pub struct SshGatewayDialer {
    opts: ConnectOptions,
}

impl SshGatewayDialer {
    pub fn new(opts: ConnectOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl GatewayDialer for SshGatewayDialer {
    async fn dial(&self, gateway: &Gateway) -> Result<Arc<dyn GatewayClient>, TunnelError> {
        let cred = Credential::from(gateway);
        let handle = ssh::connect(&gateway.host, gateway.port, &cred, &self.opts).await?;
        Ok(Arc::new(SshGatewayClient {
            handle,
            name: gateway.name.clone(),
        }))
    }
}

struct SshGatewayClient {
    handle: SshHandle,
    name: String,
}

const LIVENESS_POLL: Duration = Duration::from_secs(1);

#[async_trait]
impl GatewayClient for SshGatewayClient {
    async fn open_direct(&self, host: &str, port: u16) -> Result<Box<dyn ByteStream>, TunnelError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| TunnelError::RemoteDial(format!("{host}:{port}: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn closed(&self) {
        while !self.handle.is_closed() {
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    }

    async fn close(&self) {
        debug!("Closing gateway client {}", self.name);
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
