//! Protocol adapters.
//!
//! Every adapter follows one contract: dial the target (through the gateway
//! tunnel when the asset has one), fire the readiness signal, then shuttle
//! bytes between the session's pipes and the remote until the session goes
//! away.
//!
//! ```text
//! ssh.rs    — interactive shell over russh
//! telnet.rs — raw TCP with option refusal and heuristic login
//! db.rs     — redis-cli / mysql / psql / mongosh inside a PTY
//! guacd.rs  — RDP/VNC through the guacd daemon
//! ```

pub mod db;
pub mod guacd;
pub mod ssh;
pub mod telnet;

use std::fmt;
use std::sync::Arc;

use crate::error::ApiError;
use crate::model::GlobalSettings;
use crate::sessions::channels::AdapterEnds;
use crate::sessions::Session;
use crate::ssh::ConnectOptions;
use crate::tunnel::TunnelManager;

pub use telnet::TelnetPrompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Redis,
    Mysql,
    Postgres,
    Mongo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuacdKind {
    Rdp,
    Vnc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Telnet,
    Db(DbKind),
    Guacd(GuacdKind),
}

impl Protocol {
    /// Parse the name part of a `name[:port]` protocol string.
    pub fn parse(protocol: &str) -> Result<Self, ApiError> {
        let name = protocol.split(':').next().unwrap_or_default().trim();
        Ok(match name.to_ascii_lowercase().as_str() {
            "ssh" => Self::Ssh,
            "telnet" => Self::Telnet,
            "redis" => Self::Db(DbKind::Redis),
            "mysql" => Self::Db(DbKind::Mysql),
            "postgresql" | "postgres" => Self::Db(DbKind::Postgres),
            "mongodb" | "mongo" => Self::Db(DbKind::Mongo),
            "rdp" => Self::Guacd(GuacdKind::Rdp),
            "vnc" => Self::Guacd(GuacdKind::Vnc),
            _ => return Err(ApiError::invalid_argument(format!("unsupported protocol {protocol}"))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Telnet => "telnet",
            Self::Db(DbKind::Redis) => "redis",
            Self::Db(DbKind::Mysql) => "mysql",
            Self::Db(DbKind::Postgres) => "postgresql",
            Self::Db(DbKind::Mongo) => "mongodb",
            Self::Guacd(GuacdKind::Rdp) => "rdp",
            Self::Guacd(GuacdKind::Vnc) => "vnc",
        }
    }

    pub fn is_guacd(self) -> bool {
        matches!(self, Self::Guacd(_))
    }

    pub fn is_ssh(self) -> bool {
        self == Self::Ssh
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-wide adapter settings.
#[derive(Clone)]
pub struct AdapterOptions {
    pub ssh: ConnectOptions,
    pub telnet: TelnetPrompts,
    pub guacd_host: String,
    pub guacd_port: u16,
}

/// Everything an adapter needs besides its pipe ends.
#[derive(Clone)]
pub struct AdapterContext {
    pub session: Arc<Session>,
    pub tunnels: Arc<TunnelManager>,
    pub options: Arc<AdapterOptions>,
    pub settings: Arc<GlobalSettings>,
    /// The raw protocol string, e.g. `ssh:22`.
    pub protocol: String,
}

impl AdapterContext {
    /// Where to connect: the asset itself, or the local end of a gateway
    /// tunnel.
    pub async fn target(&self) -> Result<(String, u16), ApiError> {
        let s = &self.session;
        let route = self
            .tunnels
            .proxy(false, &s.id, &self.protocol, &s.asset, s.gateway.as_ref())
            .await
            .map_err(ApiError::connect_server)?;
        Ok((route.host, route.port))
    }
}

/// Start the adapter for the session's protocol on its task group.
pub fn spawn_adapter(ctx: AdapterContext, ends: AdapterEnds) {
    let group = ctx.session.group.clone();
    match ctx.session.protocol {
        Protocol::Ssh => group.spawn("ssh", ssh::run(ctx, ends)),
        Protocol::Telnet => group.spawn("telnet", telnet::run(ctx, ends)),
        Protocol::Db(kind) => group.spawn("db", db::run(ctx, kind, ends)),
        Protocol::Guacd(_) => group.spawn("guacd", guacd::run(ctx, ends)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol() {
        assert_eq!(Protocol::parse("ssh:22").unwrap(), Protocol::Ssh);
        assert_eq!(Protocol::parse("RDP:3389").unwrap(), Protocol::Guacd(GuacdKind::Rdp));
        assert_eq!(Protocol::parse("postgresql:5432").unwrap(), Protocol::Db(DbKind::Postgres));
        assert_eq!(Protocol::parse("mongodb").unwrap().name(), "mongodb");
        assert!(matches!(
            Protocol::parse("ftp:21"),
            Err(ApiError::InvalidArgument { .. })
        ));
        assert!(Protocol::parse("vnc:5900").unwrap().is_guacd());
    }
}
