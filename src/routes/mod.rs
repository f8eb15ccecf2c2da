//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. Everything except
//! [`health`] and the share link requires a session cookie or an API key via
//! the [`crate::auth::require_user`] middleware.

pub mod connect;
pub mod health;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth;
use crate::AppState;

/// Assemble every route. Transport layers (tracing, connection limits) are
/// added by the caller.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/connect/share/{share_id}", get(connect::share));

    let authed_routes = Router::new()
        .route("/connect/sessions", get(connect::sessions))
        .route("/connect/close/{session_id}", post(connect::close))
        .route("/connect/monitor/{session_id}", get(connect::monitor))
        .route(
            "/connect/{asset_id}/{account_id}/{protocol}",
            get(connect::connect),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth::require_user,
        ));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::Authenticator;
    use crate::config::Config;
    use crate::connect::tests::{fixture, Fixture};
    use crate::signer::Signer;
    use crate::store::AccessControl;

    fn app(fx: &Fixture) -> Router {
        let config = Config::default();
        let auth = Authenticator::new(
            &config.auth,
            Arc::clone(&fx.inventory) as Arc<dyn AccessControl>,
        );
        router(AppState {
            config: Arc::new(config),
            start_time: Instant::now(),
            orchestrator: Arc::clone(&fx.orch),
            auth: Arc::new(auth),
        })
    }

    fn cookie(uid: u64, admin: bool) -> String {
        let auth = Config::default().auth;
        let roles: Vec<&str> = if admin { vec!["acl_admin"] } else { Vec::new() };
        let payload = json!({"uid": uid, "acl": {"userName": "u", "parentRoles": roles}});
        let signed = Signer::new(&auth.secret_key, &auth.salt)
            .sign(payload.to_string().as_bytes())
            .unwrap();
        format!("{}={signed}", auth.cookie_name)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let fx = fixture(1, 3600).await;
        let resp = app(&fx)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["storage"]["kind"], "local");
    }

    #[tokio::test]
    async fn test_sessions_requires_credentials_and_admin() {
        let fx = fixture(1, 3600).await;
        let resp = app(&fx)
            .oneshot(Request::get("/connect/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(&fx)
            .oneshot(
                Request::get("/connect/sessions")
                    .header(header::COOKIE, cookie(7, false))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["code"], 4003);

        let resp = app(&fx)
            .oneshot(
                Request::get("/connect/sessions")
                    .header(header::COOKIE, cookie(1, true))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!([]));
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let fx = fixture(1, 3600).await;
        let resp = app(&fx)
            .oneshot(
                Request::post("/connect/close/nope")
                    .header(header::COOKIE, cookie(1, true))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], 4005);
    }
}
