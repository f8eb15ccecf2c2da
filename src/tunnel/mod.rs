//! Reaching assets through SSH jump hosts.
//!
//! One pooled SSH client per gateway is shared by every session that goes
//! through it. Each session gets its own loopback listener that accepts a
//! single local connection and bridges it to the asset over a `direct-tcpip`
//! channel.
//!
//! ```text
//! gateway.rs — GatewayClient / GatewayDialer traits, russh implementation
//! pool.rs    — TunnelManager: ref-counted client pool, per-session tunnels
//! ```

pub mod gateway;
pub mod pool;

use thiserror::Error;

pub use gateway::{ByteStream, GatewayClient, GatewayDialer, SshGatewayDialer};
pub use pool::{Route, Tunnel, TunnelManager};

use crate::model::Asset;
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("gateway: {0}")]
    Ssh(#[from] SshError),
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote dial failed: {0}")]
    RemoteDial(String),
    #[error("remote dial timed out")]
    RemoteTimeout,
    #[error("no local connection within {0:?}")]
    AcceptTimeout(std::time::Duration),
    #[error("tunnel closed")]
    Closed,
    #[error("no port for protocol {protocol:?} on asset {asset}")]
    NoPort { protocol: String, asset: String },
}

/// Derive the asset's `(host, port)` for the comma-separated `protocols`.
///
/// An explicit port on the asset address wins. Otherwise the asset's
/// protocol entry starting with a requested protocol name supplies it, and
/// a requested `name:port` token is used as a last resort.
pub fn resolve_target(asset: &Asset, protocols: &str) -> Result<(String, u16), TunnelError> {
    let ip = asset.ip.trim();
    if let Ok(addr) = ip.parse::<std::net::SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if let Some((host, port)) = ip.split_once(':') {
        if !port.contains(':') {
            if let Ok(port) = port.parse() {
                return Ok((host.to_string(), port));
            }
        }
    }

    for token in protocols.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let name = token.split(':').next().unwrap_or(token).to_lowercase();
        let from_asset = asset
            .protocols
            .iter()
            .filter(|p| p.to_lowercase().starts_with(&name))
            .find_map(|p| p.split_once(':').and_then(|(_, port)| port.parse().ok()));
        let from_token = token.split_once(':').and_then(|(_, port)| port.parse().ok());
        if let Some(port) = from_asset.or(from_token) {
            return Ok((ip.to_string(), port));
        }
    }
    Err(TunnelError::NoPort {
        protocol: protocols.to_string(),
        asset: asset.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(ip: &str, protocols: &[&str]) -> Asset {
        Asset {
            id: 1,
            name: "a".into(),
            ip: ip.into(),
            protocols: protocols.iter().map(ToString::to_string).collect(),
            ..Asset::default()
        }
    }

    #[test]
    fn test_explicit_port_wins() {
        let a = asset("10.0.0.1:2222", &["ssh:22"]);
        assert_eq!(resolve_target(&a, "ssh").unwrap(), ("10.0.0.1".into(), 2222));
        let a = asset("[fe80::1]:2200", &["ssh:22"]);
        assert_eq!(resolve_target(&a, "ssh").unwrap(), ("fe80::1".into(), 2200));
    }

    #[test]
    fn test_port_from_asset_protocols() {
        let a = asset("10.0.0.1", &["ssh:22", "rdp:3390"]);
        assert_eq!(resolve_target(&a, "rdp").unwrap().1, 3390);
        assert_eq!(resolve_target(&a, "ssh:22").unwrap().1, 22);
        assert_eq!(resolve_target(&a, "vnc,rdp").unwrap().1, 3390);
    }

    #[test]
    fn test_raw_ipv6_and_token_fallback() {
        let a = asset("fe80::1", &["ssh:22"]);
        assert_eq!(resolve_target(&a, "ssh").unwrap(), ("fe80::1".into(), 22));
        let a = asset("db.local", &[]);
        assert_eq!(resolve_target(&a, "mysql:3306").unwrap().1, 3306);
        assert!(matches!(
            resolve_target(&a, "redis"),
            Err(TunnelError::NoPort { .. })
        ));
    }
}
