use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::{Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use hostpool_broker::Session;
use sha2::Sha256;
use uuid::Uuid;

use crate::state::AppState;

const COOKIE_NAME: &str = "hostpool_session";

type HmacSha256 = Hmac<Sha256>;

/// One client's session values.
#[derive(Default)]
pub struct SessionData {
    values: RwLock<HashMap<String, String>>,
}

impl Session for SessionData {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().expect("session lock poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values
            .write()
            .expect("session lock poisoned")
            .insert(key.to_string(), value);
    }
}

/// Cookie-identified session storage.
///
/// The cookie carries `<id>.<sig>` where `sig` is an HMAC over the id; a
/// forged or stale cookie silently gets a fresh session. Values live in
/// memory only, which matches what the deduplicator needs from them.
pub struct SessionLayer {
    secret: Vec<u8>,
    sessions: RwLock<HashMap<String, Arc<SessionData>>>,
}

impl SessionLayer {
    pub fn new(secret: &str) -> SessionLayer {
        SessionLayer {
            secret: secret.as_bytes().to_vec(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn verify(&self, id: &str, sig: &str) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(id.as_bytes());
        match URL_SAFE_NO_PAD.decode(sig) {
            Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    fn lookup(&self, cookie_header: Option<&str>) -> Option<Arc<SessionData>> {
        let header = cookie_header?;
        let value = header.split(';').find_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            (name == COOKIE_NAME).then_some(value)
        })?;
        let (id, sig) = value.split_once('.')?;
        if !self.verify(id, sig) {
            return None;
        }
        self.sessions
            .read()
            .expect("session table poisoned")
            .get(id)
            .cloned()
    }

    /// The session for a request: the verified existing one, or a fresh one
    /// along with the `Set-Cookie` value that hands it to the client.
    pub fn acquire(&self, cookie_header: Option<&str>) -> (Arc<SessionData>, Option<String>) {
        if let Some(session) = self.lookup(cookie_header) {
            return (session, None);
        }
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(SessionData::default());
        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(id.clone(), session.clone());
        let cookie = format!(
            "{}={}.{}; Path=/; HttpOnly",
            COOKIE_NAME,
            id,
            self.sign(&id)
        );
        (session, Some(cookie))
    }
}

/// Attach the request's session to the extensions and emit `Set-Cookie` for
/// new sessions.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let cookie_header = request
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (session, set_cookie) = state.sessions.acquire(cookie_header.as_deref());
    request.extensions_mut().insert(session);

    let mut response = next.run(request).await;
    if let Some(cookie) = set_cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_request_gets_cookie_and_reuse_works() {
        let layer = SessionLayer::new("secret");
        let (session, cookie) = layer.acquire(None);
        let cookie = cookie.expect("fresh session sets a cookie");
        session.set("k", "v".to_string());

        let header = cookie.split(';').next().unwrap().to_string();
        let (again, no_cookie) = layer.acquire(Some(&header));
        assert!(no_cookie.is_none());
        assert_eq!(again.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn forged_signature_gets_a_fresh_session() {
        let layer = SessionLayer::new("secret");
        let (_, cookie) = layer.acquire(None);
        let header = cookie.unwrap().split(';').next().unwrap().to_string();
        let forged = format!("{}x", header);
        let (_, new_cookie) = layer.acquire(Some(&forged));
        assert!(new_cookie.is_some(), "tampered cookie must not resolve");
    }

    #[test]
    fn sessions_are_isolated() {
        let layer = SessionLayer::new("secret");
        let (a, _) = layer.acquire(None);
        let (b, _) = layer.acquire(None);
        a.set("k", "from-a".to_string());
        assert!(b.get("k").is_none());
    }
}
