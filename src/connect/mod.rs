//! Session orchestration.
//!
//! ```text
//! mod.rs     — Orchestrator: admission, control loop, teardown, admin close
//! monitor.rs — read-only attach to a live session
//! ```
//!
//! A session is admitted (lookups, policy, adapter readiness), registered in
//! the online map, driven by one control loop until something ends it, then
//! torn down exactly once. Whatever ended it is written to the client as a
//! single farewell before the transport closes.

pub mod monitor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{farewell_line, session_end_message, ApiError};
use crate::guacd::tunnel::Viewport;
use crate::guacd::Instruction;
use crate::model::{
    CurrentUser, GlobalSettings, SessionCmd, SessionRecord, SessionStatus, SessionType, Share,
};
use crate::policy::{check_time, share_active};
use crate::protocols::{spawn_adapter, AdapterContext, AdapterOptions, Protocol};
use crate::recorder::Recorder;
use crate::sessions::channels::{session_channels, ControlEnds};
use crate::sessions::utf8::pump_runes;
use crate::sessions::{
    ClientSink, ClientSource, Inbound, Session, SessionInit, SessionRegistry, WindowSize,
};
use crate::ssh::join_host_port;
use crate::storage::{PathStrategy, Provider};
use crate::store::{AccessControl, Store};
use crate::terminal::{CommandParser, ForbiddenRule, ParserOptions};
use crate::tunnel::TunnelManager;

const POLICY_INTERVAL: Duration = Duration::from_secs(60);
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);
const CLEAR_LINE: &[u8] = b"\x15\r";

/// The process-wide settings snapshot. Readers take a cheap `Arc`; the
/// refresh task swaps in a new one.
#[derive(Clone)]
pub struct SettingsHandle(Arc<RwLock<Arc<GlobalSettings>>>);

impl SettingsHandle {
    pub fn new(settings: GlobalSettings) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(settings))))
    }

    pub fn current(&self) -> Arc<GlobalSettings> {
        Arc::clone(&self.0.read())
    }

    /// Returns true when `settings` differs from the current snapshot.
    pub fn replace(&self, settings: GlobalSettings) -> bool {
        let mut current = self.0.write();
        if **current == settings {
            return false;
        }
        *current = Arc::new(settings);
        true
    }
}

/// Where finished recordings go.
#[derive(Clone)]
pub struct ReplayOptions {
    /// Local directory casts are written to while the session runs.
    pub staging: PathBuf,
    pub provider: Arc<dyn Provider>,
    pub strategy: PathStrategy,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub user: CurrentUser,
    pub asset_id: u64,
    pub account_id: u64,
    /// Protocol string as requested, e.g. `ssh` or `rdp:3389`.
    pub protocol: String,
    pub viewport: Viewport,
    pub client_ip: String,
    pub lang: String,
    pub session_type: SessionType,
    /// Set when the session is opened from a share link.
    pub share: Option<Share>,
}

/// Control-loop ends of an admitted session.
struct Live {
    session: Arc<Session>,
    close_rx: mpsc::Receiver<String>,
    in_writer: DuplexStream,
    out_rx: mpsc::Receiver<Vec<u8>>,
    window_tx: mpsc::Sender<WindowSize>,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    acl: Arc<dyn AccessControl>,
    tunnels: Arc<TunnelManager>,
    registry: SessionRegistry,
    settings: SettingsHandle,
    replay: ReplayOptions,
    adapters: Arc<AdapterOptions>,
    scrub_markers: Vec<String>,
    audit: mpsc::UnboundedSender<SessionCmd>,
}

impl Orchestrator {
    /// Must be called inside a Tokio runtime: a task forwarding command
    /// audit records to the store is spawned here.
    pub fn new(
        store: Arc<dyn Store>,
        acl: Arc<dyn AccessControl>,
        tunnels: Arc<TunnelManager>,
        settings: SettingsHandle,
        replay: ReplayOptions,
        adapters: AdapterOptions,
        scrub_markers: Vec<String>,
    ) -> Self {
        let (audit, mut audit_rx) = mpsc::unbounded_channel::<SessionCmd>();
        let audit_store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(cmd) = audit_rx.recv().await {
                if let Err(e) = audit_store.insert_session_cmd(&cmd).await {
                    warn!("Session {} command audit failed: {e}", cmd.session_id);
                }
            }
        });
        Self {
            store,
            acl,
            tunnels,
            registry: SessionRegistry::new(),
            settings,
            replay,
            adapters: Arc::new(adapters),
            scrub_markers,
            audit,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn acl(&self) -> &Arc<dyn AccessControl> {
        &self.acl
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn replay_provider(&self) -> &Arc<dyn Provider> {
        &self.replay.provider
    }

    /// Run one session from admission to teardown. Returns the error that
    /// ended it, or `Ok` when the client or the remote simply went away.
    pub async fn connect(
        &self,
        req: ConnectRequest,
        sink: ClientSink,
        source: ClientSource,
    ) -> Result<(), ApiError> {
        let guacd = Protocol::parse(&req.protocol).is_ok_and(Protocol::is_guacd);
        let lang = req.lang.clone();
        let live = match self.admit(req).await {
            Ok(live) => live,
            Err(e) => {
                farewell(&sink, &e, guacd, &lang).await;
                sink.close(None).await;
                return Err(e);
            }
        };
        let result = self.run(live, &sink, source).await;
        sink.close(None).await;
        result
    }

    async fn admit(&self, req: ConnectRequest) -> Result<Live, ApiError> {
        let protocol = Protocol::parse(&req.protocol)?;
        let asset = self
            .store
            .asset(req.asset_id)
            .await
            .map_err(ApiError::invalid_argument)?;
        let account = self
            .store
            .account(req.account_id)
            .await
            .map_err(ApiError::invalid_argument)?;
        let gateway = if asset.gateway_id == 0 {
            None
        } else {
            Some(
                self.store
                    .gateway(asset.gateway_id)
                    .await
                    .map_err(ApiError::invalid_argument)?,
            )
        };
        let commands = if protocol.is_guacd() {
            Vec::new()
        } else {
            self.store
                .commands(&asset.access_auth.cmd_ids)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
        };

        if !check_time(&asset.access_auth) {
            return Err(ApiError::AccessTime);
        }
        match &req.share {
            Some(share) => {
                if !share_active(Some(share.end), Utc::now()) {
                    return Err(ApiError::AccessTime);
                }
            }
            None => {
                if !self.acl.authorized(&req.user, asset.id, account.id).await {
                    return Err(ApiError::no_perm("connect"));
                }
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            session_type: req.session_type,
            session_id: session_id.clone(),
            uid: req.user.uid,
            user_name: req.user.user_name.clone(),
            asset_id: asset.id,
            asset_info: format!("{}({})", asset.name, asset.ip),
            account_id: account.id,
            account_info: format!("{}({})", account.name, account.account),
            gateway_id: gateway.as_ref().map_or(0, |g| g.id),
            gateway_info: gateway
                .as_ref()
                .map(|g| format!("{}({})", g.name, join_host_port(&g.host, g.port)))
                .unwrap_or_default(),
            client_ip: req.client_ip,
            protocol: req.protocol.clone(),
            share_id: req.share.as_ref().map_or(0, |s| s.id),
            share_end: req.share.as_ref().map(|s| s.end),
            status: SessionStatus::Online,
            created_at: Utc::now(),
            closed_at: None,
        };

        // Terminal viewports are character grids; keep them within what the
        // emulator will allocate.
        let viewport = if protocol.is_guacd() {
            req.viewport
        } else {
            let win = WindowSize::clamped(req.viewport.width, req.viewport.height);
            Viewport {
                width: u32::from(win.width),
                height: u32::from(win.height),
                dpi: req.viewport.dpi,
            }
        };
        let (width, height) = (viewport.width as usize, viewport.height as usize);
        let (parser, recorder) = if protocol.is_guacd() {
            (None, None)
        } else {
            let opts = ParserOptions {
                width,
                height,
                ssh: protocol.is_ssh(),
                scrub_markers: self.scrub_markers.clone(),
            };
            let parser = CommandParser::new(
                &session_id,
                &opts,
                ForbiddenRule::compile(&commands),
                self.audit.clone(),
            );
            let recorder = Recorder::create(&self.replay.staging, &session_id, width, height)
                .await
                .map_err(|e| ApiError::Internal(format!("recorder: {e}")))?;
            (Some(parser), Some(recorder))
        };

        let (session, close_rx) = Session::new(SessionInit {
            record,
            asset,
            account,
            gateway,
            protocol,
            viewport,
            lang: req.lang,
            parser,
            recorder,
        });
        let session = Arc::new(session);

        let (ctl, ends) = session_channels();
        let ControlEnds {
            in_writer,
            out_pipe,
            out_rx,
            window_tx,
            ready_rx,
        } = ctl;
        if !protocol.is_guacd() {
            session
                .group
                .spawn("out-runes", pump_runes(out_pipe, ends.out_tx.clone()));
        }
        let ctx = AdapterContext {
            session: Arc::clone(&session),
            tunnels: Arc::clone(&self.tunnels),
            options: Arc::clone(&self.adapters),
            settings: self.settings.current(),
            protocol: req.protocol,
        };
        spawn_adapter(ctx, ends);

        let ready = ready_rx.await.unwrap_or_else(|_| {
            Err(session
                .group
                .first_error()
                .unwrap_or_else(|| ApiError::connect_server("adapter stopped before connecting")))
        });
        if let Err(e) = ready {
            warn!("Session {} connect failed: {e}", session.id);
            self.discard(&session).await;
            return Err(e);
        }

        self.registry.insert(Arc::clone(&session));
        let record = session.record();
        if let Err(e) = self.store.upsert_session(&record).await {
            warn!("Session {} persist failed: {e}", session.id);
        }
        info!(
            "Session {} online: {} -> {} as {} over {}",
            session.id, record.user_name, record.asset_info, record.account_info, record.protocol
        );

        Ok(Live {
            session,
            close_rx,
            in_writer,
            out_rx,
            window_tx,
        })
    }

    async fn run(
        &self,
        live: Live,
        sink: &ClientSink,
        source: ClientSource,
    ) -> Result<(), ApiError> {
        let Live {
            session,
            mut close_rx,
            mut in_writer,
            mut out_rx,
            window_tx,
        } = live;
        let (in_tx, mut in_rx) = mpsc::channel(256);
        spawn_reader(&session, source, in_tx);

        let idle = Duration::from_secs(self.settings.current().timeout);
        let idle_deadline = tokio::time::sleep(idle);
        tokio::pin!(idle_deadline);
        let now = Instant::now();
        let mut policy = interval_at(now + POLICY_INTERVAL, POLICY_INTERVAL);
        let mut flush = interval_at(now + FLUSH_INTERVAL, FLUSH_INTERVAL);
        let mut keepalive = interval_at(now + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut out_buf = Vec::new();

        let reason = loop {
            tokio::select! {
                () = session.group.cancelled() => break session.group.first_error(),
                () = session.away.wait() => break None,
                () = &mut idle_deadline => break Some(ApiError::IdleTimeout { seconds: idle.as_secs() }),
                _ = policy.tick() => {
                    if let Err(e) = self.recheck(&session).await {
                        break Some(e);
                    }
                }
                Some(admin) = close_rx.recv() => break Some(ApiError::AdminClose { admin }),
                msg = in_rx.recv() => {
                    let Some(msg) = msg else { break None };
                    if msg.is_activity() {
                        idle_deadline.as_mut().reset(Instant::now() + idle);
                    }
                    handle_inbound(&session, msg, &mut in_writer, &window_tx, &mut out_buf).await;
                }
                Some(bytes) = out_rx.recv() => handle_output(&session, sink, bytes, &mut out_buf).await,
                _ = flush.tick() => flush_output(&session, sink, &mut out_buf).await,
                _ = keepalive.tick() => {
                    let _ = sink.keepalive().await;
                }
            }
        };

        while let Ok(bytes) = out_rx.try_recv() {
            handle_output(&session, sink, bytes, &mut out_buf).await;
        }
        flush_output(&session, sink, &mut out_buf).await;
        if let Some(err) = &reason {
            info!("Session {} ending: {err}", session.id);
            farewell(sink, err, session.protocol.is_guacd(), &session.lang).await;
        }
        self.teardown(&session).await;
        reason.map_or(Ok(()), Err)
    }

    /// Periodic policy check: the asset's time window, then the share end.
    async fn recheck(&self, session: &Session) -> Result<(), ApiError> {
        let auth = match self.store.asset(session.asset.id).await {
            Ok(asset) => asset.access_auth,
            Err(e) => {
                warn!("Session {} policy refetch failed: {e}", session.id);
                session.asset.access_auth.clone()
            }
        };
        if !check_time(&auth) {
            return Err(ApiError::AccessTime);
        }
        let record = session.record();
        if record.share_id != 0 && !share_active(record.share_end, Utc::now()) {
            return Err(ApiError::AccessTime);
        }
        Ok(())
    }

    /// Release what a session that never went online acquired.
    async fn discard(&self, session: &Session) {
        session.away.close();
        session.group.shutdown(TEARDOWN_GRACE).await;
        if let Some(client) = session.take_ssh_client() {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        self.tunnels.close_tunnels(&[session.id.as_str()]).await;
        if let Some(recorder) = &session.recorder {
            let _ = tokio::fs::remove_file(recorder.path()).await;
        }
    }

    /// Runs once per online session, whatever ended it.
    async fn teardown(&self, session: &Session) {
        session.away.close();
        session.group.shutdown(TEARDOWN_GRACE).await;
        if let Some(parser) = &session.parser {
            parser.close();
        }
        if let Some(recorder) = &session.recorder {
            match recorder
                .close(&self.replay.provider, self.replay.strategy)
                .await
            {
                Ok(Some(key)) => debug!("Session {} replay stored as {key}", session.id),
                Ok(None) => {}
                Err(e) => warn!("Session {} replay upload failed: {e}", session.id),
            }
        }
        if let Some(record) = session.mark_offline() {
            if let Err(e) = self.store.upsert_session(&record).await {
                warn!("Session {} persist failed: {e}", session.id);
            }
        }
        if let Some(client) = session.take_ssh_client() {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        self.tunnels.close_tunnels(&[session.id.as_str()]).await;
        self.registry.remove(&session.id);

        let bye = session_end_message(&session.id);
        for monitor in session.drain_monitors() {
            if monitor.try_send_text(bye.clone()) {
                monitor.try_close();
            }
        }
        info!("Session {} offline", session.id);
    }

    /// Administrator request to end a live session.
    pub fn close_session(&self, user: &CurrentUser, session_id: &str) -> Result<(), ApiError> {
        if !user.is_admin() {
            return Err(ApiError::no_perm("close session"));
        }
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| ApiError::InvalidSessionId {
                session_id: session_id.to_string(),
            })?;
        if !session.request_close(&user.user_name) {
            debug!("Session {session_id} close already requested");
        }
        Ok(())
    }

    /// Online sessions, for administrators.
    pub fn online(&self, user: &CurrentUser) -> Result<Vec<SessionRecord>, ApiError> {
        if !user.is_admin() {
            return Err(ApiError::no_perm("list sessions"));
        }
        Ok(self.registry.records())
    }

    /// Resolve a share link and spend one of its uses.
    pub async fn redeem_share(&self, share_uuid: &str) -> Result<Share, ApiError> {
        let share = self
            .store
            .share(share_uuid)
            .await
            .map_err(ApiError::invalid_argument)?;
        if !share_active(Some(share.end), Utc::now()) {
            return Err(ApiError::invalid_argument("share link has expired"));
        }
        let spent = self
            .store
            .consume_share(share_uuid)
            .await
            .map_err(ApiError::invalid_argument)?;
        if !spent {
            return Err(ApiError::invalid_argument("share link has no uses left"));
        }
        Ok(share)
    }

    /// Signal every online session to end and wait up to `wait` for their
    /// teardown to finish. Returns how many were signalled.
    pub async fn close_all(&self, wait: Duration) -> usize {
        let closed = self.registry.close_all();
        let deadline = Instant::now() + wait;
        while !self.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        closed
    }
}

/// The user built for a share link: the share creator's identity, no roles.
pub fn share_user(share: &Share) -> CurrentUser {
    CurrentUser {
        uid: share.uid,
        user_name: share.user_name.clone(),
        roles: Vec::new(),
    }
}

fn spawn_reader(session: &Arc<Session>, mut source: ClientSource, in_tx: mpsc::Sender<Inbound>) {
    let s = Arc::clone(session);
    let raw = s.protocol.is_guacd();
    session.group.spawn("client-read", async move {
        loop {
            tokio::select! {
                () = s.away.wait() => break,
                msg = source.next(raw) => match msg {
                    Some(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!("Session {} client disconnected", s.id);
                        s.away.close();
                        break;
                    }
                },
            }
        }
        Ok(())
    });
}

async fn handle_inbound(
    session: &Session,
    msg: Inbound,
    in_writer: &mut DuplexStream,
    window_tx: &mpsc::Sender<WindowSize>,
    out_buf: &mut Vec<u8>,
) {
    let written = match msg {
        Inbound::Data(bytes) => {
            match session.parser.as_ref().and_then(|p| p.add_input(&bytes)) {
                Some(blocked) => {
                    info!("Session {} blocked forbidden command: {}", session.id, blocked.label);
                    let warning = farewell_line(&format!("{} is forbidden\n", blocked.label));
                    out_buf.extend_from_slice(warning.as_bytes());
                    let mut forward = bytes;
                    forward.truncate(blocked.allowed);
                    forward.extend_from_slice(CLEAR_LINE);
                    in_writer.write_all(&forward).await
                }
                None => in_writer.write_all(&bytes).await,
            }
        }
        Inbound::Raw(raw) => in_writer.write_all(raw.as_bytes()).await,
        Inbound::Resize(win) => {
            let _ = window_tx.try_send(win);
            if win.width > 0 && win.height > 0 {
                let (w, h) = (usize::from(win.width), usize::from(win.height));
                if let Some(parser) = &session.parser {
                    parser.resize(w, h);
                }
                if let Some(recorder) = &session.recorder {
                    recorder.resize(w, h);
                }
            }
            Ok(())
        }
        Inbound::Ping => Ok(()),
    };
    if let Err(e) = written {
        debug!("Session {} in-pipe closed: {e}", session.id);
    }
}

async fn handle_output(session: &Session, sink: &ClientSink, bytes: Vec<u8>, out_buf: &mut Vec<u8>) {
    if session.protocol.is_guacd() {
        let text = String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        let _ = sink.send_text(text).await;
        return;
    }
    if let Some(parser) = &session.parser {
        parser.add_output(&bytes);
    }
    out_buf.extend_from_slice(&bytes);
}

/// Write buffered terminal output to the recorder, every monitor and the
/// client, in that order.
async fn flush_output(session: &Session, sink: &ClientSink, out_buf: &mut Vec<u8>) {
    if out_buf.is_empty() {
        return;
    }
    let data = std::mem::take(out_buf);
    if let Some(recorder) = &session.recorder {
        recorder.write(&data);
    }
    let text = String::from_utf8_lossy(&data).into_owned();
    session.fan_out(&text);
    let _ = sink.send_text(text).await;
}

/// The one message a client gets when its session fails or is ended.
pub(crate) async fn farewell(sink: &ClientSink, err: &ApiError, guacd: bool, lang: &str) {
    let text = if guacd {
        Instruction::new("error", [err.message_base64(lang), err.code().to_string()]).encode()
    } else {
        farewell_line(&err.localized(lang))
    };
    let _ = sink.send_text(text).await;
}
