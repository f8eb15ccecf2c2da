//! Session endpoints: WebSocket connect, monitor and share, admin close and
//! the online list.
//!
//! Admission errors on the WebSocket routes are reported in-band after the
//! upgrade (a farewell frame, then close), so browsers always see the reason.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
    Extension, Json,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connect::{farewell, share_user, ConnectRequest, Orchestrator};
use crate::error::ApiError;
use crate::guacd::tunnel::Viewport;
use crate::model::{CurrentUser, SessionRecord, SessionType};
use crate::sessions::{ClientSink, ClientSource};
use crate::AppState;

const DEFAULT_LANG: &str = "en";

/// Viewport hints on the connect URL. Missing or zero values fall back to
/// the configured defaults; oversized ones are capped.
#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub dpi: Option<u32>,
}

impl ViewQuery {
    pub fn viewport(&self, defaults: &ServerConfig) -> Viewport {
        let pick = |v: Option<u32>, d: u32| v.filter(|v| *v > 0).unwrap_or(d);
        Viewport {
            width: pick(self.w, defaults.default_width),
            height: pick(self.h, defaults.default_height),
            dpi: pick(self.dpi, defaults.default_dpi),
        }
        .bounded()
    }
}

/// The first `X-Forwarded-For` hop, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

fn lang(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_LANG)
        .to_string()
}

fn split(socket: WebSocket) -> (ClientSink, ClientSource) {
    let (tx, rx) = socket.split();
    (ClientSink::web(tx), ClientSource::Web(rx))
}

async fn run_connect(orch: Arc<Orchestrator>, req: ConnectRequest, socket: WebSocket) {
    let (sink, source) = split(socket);
    let who = req.user.user_name.clone();
    if let Err(e) = orch.connect(req, sink, source).await {
        debug!("Connection for {who} ended: {e}");
    }
}

/// `GET /connect/{asset_id}/{account_id}/{protocol}?w=&h=&dpi=` — open a
/// session over WebSocket.
pub async fn connect(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path((asset_id, account_id, protocol)): Path<(u64, u64, String)>,
    Query(view): Query<ViewQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let req = ConnectRequest {
        user,
        asset_id,
        account_id,
        protocol,
        viewport: view.viewport(&state.config.server),
        client_ip: client_ip(&headers, peer),
        lang: lang(&headers),
        session_type: SessionType::Web,
        share: None,
    };
    let orch = Arc::clone(&state.orchestrator);
    ws.on_upgrade(move |socket| run_connect(orch, req, socket))
}

/// `GET /connect/share/{share_id}` — open the session a share link points
/// at. The link itself is the credential.
pub async fn share(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
    Query(view): Query<ViewQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let viewport = view.viewport(&state.config.server);
    let client_ip = client_ip(&headers, peer);
    let lang = lang(&headers);
    let orch = Arc::clone(&state.orchestrator);
    ws.on_upgrade(move |socket| async move {
        let share = match orch.redeem_share(&share_id).await {
            Ok(share) => share,
            Err(e) => {
                let (sink, _) = split(socket);
                farewell(&sink, &e, false, &lang).await;
                sink.close(None).await;
                return;
            }
        };
        info!("Share {share_id} redeemed from {client_ip}");
        let req = ConnectRequest {
            user: share_user(&share),
            asset_id: share.asset_id,
            account_id: share.account_id,
            protocol: share.protocol.clone(),
            viewport,
            client_ip,
            lang,
            session_type: SessionType::Web,
            share: Some(share),
        };
        run_connect(orch, req, socket).await;
    })
}

/// `GET /connect/monitor/{session_id}` — watch a live session (admin only).
pub async fn monitor(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let lang = lang(&headers);
    let orch = Arc::clone(&state.orchestrator);
    ws.on_upgrade(move |socket| async move {
        let (sink, source) = split(socket);
        if let Err(e) = orch.monitor(&user, &session_id, &lang, sink, source).await {
            debug!("Monitor of {session_id} by {} refused: {e}", user.user_name);
        }
    })
}

/// `POST /connect/close/{session_id}` — end a live session (admin only).
pub async fn close(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.close_session(&user, &session_id)?;
    info!("Session {session_id} close requested by {}", user.user_name);
    Ok(Json(json!({"code": 0, "message": "ok"})))
}

/// `GET /connect/sessions` — online sessions (admin only).
pub async fn sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    state.orchestrator.online(&user).map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_defaults() {
        let defaults = ServerConfig::default();
        let v = ViewQuery {
            w: Some(1920),
            h: Some(0),
            dpi: None,
        }
        .viewport(&defaults);
        assert_eq!(v.width, 1920);
        assert_eq!(v.height, defaults.default_height);
        assert_eq!(v.dpi, defaults.default_dpi);
    }

    #[test]
    fn test_viewport_is_capped() {
        let v = ViewQuery {
            w: Some(u32::MAX),
            h: Some(100_000),
            dpi: Some(100_000),
        }
        .viewport(&ServerConfig::default());
        assert_eq!(v.width, crate::guacd::tunnel::MAX_PIXELS);
        assert_eq!(v.height, crate::guacd::tunnel::MAX_PIXELS);
        assert_eq!(v.dpi, crate::guacd::tunnel::MAX_DPI);
    }

    #[test]
    fn test_client_ip() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.1");
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn test_lang_fallback() {
        let mut headers = HeaderMap::new();
        assert_eq!(lang(&headers), "en");
        headers.insert(header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9".parse().unwrap());
        assert_eq!(lang(&headers), "zh-CN,zh;q=0.9");
    }
}
