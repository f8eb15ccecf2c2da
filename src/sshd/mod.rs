//! SSH server front-end for native clients.
//!
//! Users authenticate with their own password or public key. The target is
//! picked either with an exec request (`connect <asset_id> <account_id>
//! <protocol>`) or by encoding it in the login name
//! (`user@asset_id@account_id@protocol`). A plain shell without a target gets
//! a listing of the assets the user may open, then the channel closes.
//!
//! A selected target runs through the same [`Orchestrator`] as the browser
//! path, with the SSH channel as the client transport.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connect::{ConnectRequest, Orchestrator};
use crate::guacd::tunnel::Viewport;
use crate::model::{Asset, CurrentUser, SessionType};
use crate::sessions::{ClientSink, ClientSource, Inbound, WindowSize};

const INPUT_CAPACITY: usize = 64;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("ssh front-end io: {0}")]
    Io(#[from] std::io::Error),
    #[error("host key: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("host key encoding: {0}")]
    Encoding(#[from] russh::keys::ssh_key::Error),
}

/// A session target chosen by a native client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub asset_id: u64,
    pub account_id: u64,
    pub protocol: String,
}

/// Split `user@asset@account@protocol` into the login name and its target.
/// Any other shape is a plain login name.
pub fn parse_login(login: &str) -> (&str, Option<Target>) {
    let parts: Vec<&str> = login.split('@').collect();
    if let [user, asset, account, protocol] = parts.as_slice() {
        if let (Ok(asset_id), Ok(account_id)) = (asset.parse(), account.parse()) {
            if !protocol.is_empty() {
                return (
                    user,
                    Some(Target {
                        asset_id,
                        account_id,
                        protocol: (*protocol).to_string(),
                    }),
                );
            }
        }
    }
    (login, None)
}

/// Parse `connect <asset_id> <account_id> <protocol>`.
pub fn parse_exec(command: &str) -> Option<Target> {
    let mut words = command.split_whitespace();
    if words.next()? != "connect" {
        return None;
    }
    let asset_id = words.next()?.parse().ok()?;
    let account_id = words.next()?.parse().ok()?;
    let protocol = words.next()?.to_string();
    if words.next().is_some() {
        return None;
    }
    Some(Target {
        asset_id,
        account_id,
        protocol,
    })
}

/// The listing shown to a client that did not pick a target.
pub fn banner(user: &CurrentUser, assets: &[Asset]) -> String {
    let mut out = format!("Welcome {}.\r\n", user.user_name);
    if assets.is_empty() {
        out.push_str("You are not authorized to access any asset.\r\n");
        return out;
    }
    out.push_str("Authorized assets:\r\n");
    for a in assets {
        let _ = write!(
            out,
            "  [{}] {} ({}) {}\r\n",
            a.id,
            a.name,
            a.ip,
            a.protocols.join(", ")
        );
    }
    out.push_str("\r\nConnect with: ssh -t <user>@<host> connect <asset_id> <account_id> <protocol>\r\n");
    out
}

struct Shared {
    orchestrator: Arc<Orchestrator>,
    dpi: u32,
}

/// Per-connection state.
struct Connection {
    shared: Arc<Shared>,
    peer: SocketAddr,
    user: Option<CurrentUser>,
    login_target: Option<Target>,
    window: WindowSize,
    inputs: HashMap<ChannelId, mpsc::Sender<Inbound>>,
}

impl Connection {
    fn new(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            user: None,
            login_target: None,
            window: WindowSize {
                width: DEFAULT_COLS,
                height: DEFAULT_ROWS,
            },
            inputs: HashMap::new(),
        }
    }

    fn accept(&mut self, user: CurrentUser, target: Option<Target>) -> Auth {
        info!("SSH login {} from {}", user.user_name, self.peer);
        self.user = Some(user);
        self.login_target = target;
        Auth::Accept
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Bridge `channel` to a new session, or print the banner when there is
    /// no target.
    fn start(&mut self, channel: ChannelId, target: Option<Target>, session: &mut Session) {
        let Some(user) = self.user.clone() else {
            let _ = session.channel_failure(channel);
            return;
        };
        let _ = session.channel_success(channel);
        let sink = ClientSink::native(session.handle(), channel);
        let orch = Arc::clone(&self.shared.orchestrator);

        let Some(target) = target else {
            tokio::spawn(async move {
                let assets = authorized_assets(&orch, &user).await;
                let _ = sink.send_text(banner(&user, &assets)).await;
                sink.close(None).await;
            });
            return;
        };

        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let _ = tx.try_send(Inbound::Resize(self.window));
        self.inputs.insert(channel, tx);
        let req = ConnectRequest {
            user,
            asset_id: target.asset_id,
            account_id: target.account_id,
            protocol: target.protocol,
            viewport: Viewport {
                width: u32::from(self.window.width),
                height: u32::from(self.window.height),
                dpi: self.shared.dpi,
            },
            client_ip: self.peer.ip().to_string(),
            lang: "en".into(),
            session_type: SessionType::Client,
            share: None,
        };
        tokio::spawn(async move {
            let who = req.user.user_name.clone();
            if let Err(e) = orch.connect(req, sink, ClientSource::Channel(rx)).await {
                debug!("SSH session for {who} ended: {e}");
            }
        });
    }
}

async fn authorized_assets(orch: &Orchestrator, user: &CurrentUser) -> Vec<Asset> {
    let grants = orch.acl().grants(user).await;
    let assets = match orch.store().list_assets().await {
        Ok(assets) => assets,
        Err(e) => {
            warn!("Asset listing for {} failed: {e}", user.user_name);
            return Vec::new();
        }
    };
    assets
        .into_iter()
        .filter(|a| grants.iter().any(|(id, _)| *id == a.id))
        .collect()
}

impl Handler for Connection {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let (name, target) = parse_login(user);
        match self.shared.orchestrator.acl().verify_password(name, password).await {
            Some(u) => Ok(self.accept(u, target)),
            None => {
                warn!("SSH password rejected for {name} from {}", self.peer);
                Ok(Self::reject())
            }
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let (name, target) = parse_login(user);
        let Ok(line) = public_key.to_openssh() else {
            return Ok(Self::reject());
        };
        match self.shared.orchestrator.acl().verify_public_key(name, &line).await {
            Some(u) => Ok(self.accept(u, target)),
            None => {
                debug!("SSH public key rejected for {name} from {}", self.peer);
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("SSH session channel {:?} opened", channel.id());
        Ok(self.user.is_some())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if col_width > 0 && row_height > 0 {
            self.window = WindowSize::clamped(col_width, row_height);
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let target = self.login_target.take();
        self.start(channel, target, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        let target = parse_exec(&command).or_else(|| self.login_target.take());
        debug!("SSH exec {command:?} on {channel:?}");
        self.start(channel, target, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.window = WindowSize::clamped(col_width, row_height);
        if let Some(tx) = self.inputs.get(&channel) {
            let _ = tx.send(Inbound::Resize(self.window)).await;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.inputs.get(&channel) {
            if tx.send(Inbound::Data(data.to_vec())).await.is_err() {
                self.inputs.remove(&channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.inputs.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("SSH channel {channel:?} closed");
        self.inputs.remove(&channel);
        Ok(())
    }
}

/// Load the host key at `path`, generating and saving an Ed25519 key when
/// the file does not exist.
pub async fn load_or_generate_host_key(path: &Path) -> Result<russh::keys::PrivateKey, FrontendError> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if tokio::fs::try_exists(path).await? {
        info!("Loading SSH host key from {}", path.display());
        return Ok(russh::keys::load_secret_key(path, None)?);
    }

    info!("Generating SSH host key at {}", path.display());
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let encoded = key.to_openssh(LineEnding::LF)?;
    tokio::fs::write(path, encoded.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(key)
}

/// Accept native clients on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    host_key: russh::keys::PrivateKey,
    orchestrator: Arc<Orchestrator>,
    dpi: u32,
    shutdown: CancellationToken,
) -> Result<(), FrontendError> {
    let config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: None,
        keys: vec![host_key],
        ..Default::default()
    });
    let shared = Arc::new(Shared { orchestrator, dpi });
    info!("SSH front-end listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("SSH accept failed: {e}");
                    continue;
                }
            },
        };
        let config = Arc::clone(&config);
        let handler = Connection::new(Arc::clone(&shared), peer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(running) => {
                    tokio::select! {
                        result = running => {
                            if let Err(e) = result {
                                debug!("SSH connection from {peer} ended: {e}");
                            }
                        }
                        () = shutdown.cancelled() => {}
                    }
                }
                Err(e) => warn!("SSH handshake with {peer} failed: {e}"),
            }
        });
    }
    info!("SSH front-end stopped");
    Ok(())
}
