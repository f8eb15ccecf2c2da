//! Request authentication.
//!
//! Two credentials are accepted on every protected route:
//!
//! - the signed `session` cookie issued by the web front-end, whose payload is
//!   `{"uid": .., "acl": {"userName": .., "roleName": .., "parentRoles": [..]}}`
//! - the `_key`/`_secret` query pair used by machine clients, where `_secret`
//!   signs the request path and the remaining query values
//!
//! The resolved [`CurrentUser`] is attached to the request as an extension.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::model::CurrentUser;
use crate::signer::Signer;
use crate::store::AccessControl;

const KEY_PARAM: &str = "_key";
const SECRET_PARAM: &str = "_secret";

#[derive(Debug, Deserialize)]
struct CookieSession {
    uid: u64,
    #[serde(default)]
    acl: CookieAcl,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookieAcl {
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    role_name: String,
    #[serde(default)]
    parent_roles: Vec<String>,
}

impl From<CookieSession> for CurrentUser {
    fn from(s: CookieSession) -> Self {
        let mut roles = s.acl.parent_roles;
        if !s.acl.role_name.is_empty() && !roles.contains(&s.acl.role_name) {
            roles.push(s.acl.role_name);
        }
        Self {
            uid: s.uid,
            user_name: s.acl.user_name,
            roles,
        }
    }
}

/// Resolves the caller of an HTTP or WebSocket request.
pub struct Authenticator {
    signer: Signer,
    cookie_name: String,
    acl: Arc<dyn AccessControl>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, acl: Arc<dyn AccessControl>) -> Self {
        Self {
            signer: Signer::new(&config.secret_key, &config.salt),
            cookie_name: config.cookie_name.clone(),
            acl,
        }
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        path: &str,
        query: &HashMap<String, String>,
    ) -> Result<CurrentUser, ApiError> {
        if let Some(key) = query.get(KEY_PARAM) {
            let secret = query.get(SECRET_PARAM).map_or("", String::as_str);
            let payload: BTreeMap<String, String> = query
                .iter()
                .filter(|(k, _)| k.as_str() != KEY_PARAM && k.as_str() != SECRET_PARAM)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return self
                .acl
                .authenticate_key(key, secret, path, &payload)
                .await
                .ok_or(ApiError::Unauthorized);
        }

        let cookie = cookie_value(headers, &self.cookie_name).ok_or(ApiError::Unauthorized)?;
        self.parse_cookie(cookie)
    }

    /// Unsign and decode a session cookie value.
    pub fn parse_cookie(&self, cookie: &str) -> Result<CurrentUser, ApiError> {
        let payload = self.signer.unsign(cookie).map_err(|e| {
            debug!("cannot unsign session cookie: {e}");
            ApiError::Unauthorized
        })?;
        let session: CookieSession = serde_json::from_slice(&payload).map_err(|e| {
            debug!("cannot decode session cookie: {e}");
            ApiError::Unauthorized
        })?;
        Ok(session.into())
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

fn query_map(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(q)| q)
        .unwrap_or_default()
}

/// Axum middleware that rejects requests without a valid credential and
/// attaches the resolved [`CurrentUser`] otherwise.
pub async fn require_user(
    State(auth): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let query = query_map(request.uri());
    let path = request.uri().path().to_string();
    match auth.authenticate(request.headers(), &path, &query).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;
    use crate::config::ApiKeyConfig;
    use crate::model::GlobalSettings;
    use crate::store::inventory::{api_signature, Inventory, InventoryData};

    fn config() -> AuthConfig {
        AuthConfig {
            secret_key: "s3cret".into(),
            salt: "cookie-session".into(),
            cookie_name: "session".into(),
            api_keys: vec![ApiKeyConfig {
                key: "k1".into(),
                secret: "shh".into(),
                uid: 9,
                user_name: "robot".into(),
                admin: true,
            }],
        }
    }

    fn authenticator() -> Authenticator {
        let cfg = config();
        let inv = Inventory::new(
            InventoryData::default(),
            GlobalSettings::default(),
            cfg.api_keys.clone(),
        );
        Authenticator::new(&cfg, Arc::new(inv))
    }

    fn cookie_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("lang=en; session={value}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[tokio::test]
    async fn test_cookie_session() {
        let auth = authenticator();
        let payload = json!({
            "uid": 3,
            "acl": {"userName": "alice", "roleName": "alice", "parentRoles": ["acl_admin"]},
        });
        let signed = Signer::new("s3cret", "cookie-session")
            .sign(payload.to_string().as_bytes())
            .unwrap();
        let user = auth
            .authenticate(&cookie_headers(&signed), "/connect/sessions", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(user.uid, 3);
        assert_eq!(user.user_name, "alice");
        assert!(user.is_admin());
    }

    #[tokio::test]
    async fn test_rejects_tampered_or_missing_cookie() {
        let auth = authenticator();
        let signed = Signer::new("other", "cookie-session")
            .sign(br#"{"uid":1}"#)
            .unwrap();
        let err = auth
            .authenticate(&cookie_headers(&signed), "/", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);

        let err = auth
            .authenticate(&HeaderMap::new(), "/", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_api_key_query() {
        let auth = authenticator();
        let path = "/connect/close/s1";
        let mut payload = BTreeMap::new();
        payload.insert("reason".to_string(), "x".to_string());
        let mut query: HashMap<String, String> = payload.clone().into_iter().collect();
        query.insert("_key".into(), "k1".into());
        query.insert("_secret".into(), api_signature(path, "shh", &payload));

        let user = auth.authenticate(&HeaderMap::new(), path, &query).await.unwrap();
        assert_eq!(user.user_name, "robot");
        assert!(user.is_admin());

        query.insert("_secret".into(), "bogus".into());
        let err = auth.authenticate(&HeaderMap::new(), path, &query).await;
        assert_eq!(err, Err(ApiError::Unauthorized));
    }

    #[test]
    fn test_query_map() {
        let uri: Uri = "/connect/1/2/ssh?w=100&_key=a%20b".parse().unwrap();
        let q = query_map(&uri);
        assert_eq!(q["w"], "100");
        assert_eq!(q["_key"], "a b");
        assert!(query_map(&"/api/health".parse().unwrap()).is_empty());
    }
}
