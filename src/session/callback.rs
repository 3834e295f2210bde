//! Thin capability layer over the `SessionStore` for OAuth callback sessions.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::store::{validate_ttl, Session, SessionStore};
use crate::constants::{DEFAULT_CALLBACK_PATH, MAX_CALLBACK_BODY};
use crate::error::{ClawkerError, Result};

const KIND: &str = "callback";

/// Snapshot of one HTTP request captured by a dynamic listener. Single-use:
/// set atomically once per session via `Session::capture_once`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapturedCallback {
    pub method: String,
    pub path: String,
    pub query: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    /// Allow-listed headers only; Cookie, Authorization, X-Forwarded-For,
    /// and X-Real-IP are stripped before the snapshot is stored.
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_as_base64")]
    pub body: Vec<u8>,
}

mod body_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Headers never preserved in a captured callback snapshot, regardless of
/// how the caller cased them.
const DENIED_HEADERS: &[&str] = &["cookie", "authorization", "x-forwarded-for", "x-real-ip"];

/// A raw inbound request, as seen by the dynamic listener, before
/// allow-list filtering and body truncation are applied.
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Register/capture/poll semantics over the `SessionStore`, scoped to
/// sessions of kind "callback".
pub struct CallbackChannel {
    store: std::sync::Arc<SessionStore>,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl CallbackChannel {
    pub fn new(store: std::sync::Arc<SessionStore>, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            max_ttl,
        }
    }

    /// Creates a callback session. Rejects ports outside `[1, 65535]`;
    /// `port = 0` is accepted by the type system but rejected here since a
    /// caller-chosen port is required. An empty path becomes `"/"`, not the
    /// component default, matching the "empty path becomes /" contract.
    pub async fn register(&self, port: u32, path: &str, ttl: Duration) -> Result<Session> {
        if port == 0 || port > 65535 {
            return Err(ClawkerError::validation(format!(
                "port {port} is outside the range [1, 65535]"
            )));
        }
        let ttl = validate_ttl(ttl, self.default_ttl, self.max_ttl)?;
        let path = if path.is_empty() { "/" } else { path };

        let mut metadata = HashMap::new();
        metadata.insert("port".to_string(), json!(port));
        metadata.insert("path".to_string(), json!(path));
        metadata.insert("received".to_string(), json!(false));

        self.store.create(KIND, ttl, metadata).await
    }

    async fn lookup(&self, session_id: &str) -> Result<Session> {
        let session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| ClawkerError::not_found(format!("no session {session_id}")))?;
        if session.kind != KIND {
            return Err(ClawkerError::validation(format!(
                "session {session_id} is not a callback session"
            )));
        }
        Ok(session)
    }

    /// Captures a request snapshot. Fails `NotFound` if the session is
    /// absent, `Validation` if the session is not kind "callback", and
    /// reports `already_received = true` if the capture-once predicate had
    /// already flipped (a duplicate callback, not an error).
    pub async fn capture(&self, session_id: &str, request: RawRequest) -> Result<bool> {
        let session = self.lookup(session_id).await?;

        let won = session.capture_once("received").await;
        if !won {
            return Ok(false);
        }

        let headers: Vec<(String, String)> = request
            .headers
            .into_iter()
            .filter(|(name, _)| !DENIED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
        let mut body = request.body;
        body.truncate(MAX_CALLBACK_BODY);

        let captured = CapturedCallback {
            method: request.method,
            path: request.path,
            query: request.query,
            received_at: chrono::Utc::now(),
            headers,
            body,
        };
        session
            .set("data", serde_json::to_value(&captured)?)
            .await;
        Ok(true)
    }

    /// Returns the captured snapshot if capture has already happened.
    pub async fn get_data(&self, session_id: &str) -> Result<Option<CapturedCallback>> {
        let session = self.lookup(session_id).await?;
        match session.get("data").await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_port(&self, session_id: &str) -> Result<u32> {
        let session = self.lookup(session_id).await?;
        Ok(session
            .get("port")
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32)
    }

    pub async fn get_path(&self, session_id: &str) -> Result<String> {
        let session = self.lookup(session_id).await?;
        Ok(session
            .get("path")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CALLBACK_PATH.to_string()))
    }

    pub async fn is_received(&self, session_id: &str) -> Result<bool> {
        let session = self.lookup(session_id).await?;
        Ok(session
            .get("received")
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Idempotent: deleting an absent session is not an error.
    pub async fn delete(&self, session_id: &str) {
        self.store.delete(session_id).await;
    }

    /// Resolves a bound port to the session registered on it, for the
    /// dynamic listener's catch-all handler. `None` if no live callback
    /// session is currently registered on that port.
    pub async fn find_by_port(&self, port: u32, sessions: &[Session]) -> Option<String> {
        for session in sessions {
            if session.kind != KIND {
                continue;
            }
            if session.get("port").await.and_then(|v| v.as_u64()) == Some(port as u64) {
                return Some(session.id.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> CallbackChannel {
        CallbackChannel::new(
            SessionStore::new(),
            Duration::from_secs(300),
            Duration::from_secs(1800),
        )
    }

    #[tokio::test]
    async fn register_rejects_out_of_range_port() {
        let channel = channel();
        assert!(channel.register(0, "/callback", Duration::ZERO).await.is_err());
        assert!(channel
            .register(70000, "/callback", Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn register_empty_path_becomes_slash() {
        let channel = channel();
        let session = channel.register(8765, "", Duration::ZERO).await.unwrap();
        assert_eq!(channel.get_path(&session.id).await.unwrap(), "/");
    }

    #[tokio::test]
    async fn full_round_trip_s1() {
        let channel = channel();
        let session = channel
            .register(8765, "/callback", Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(session.id.len(), 32);

        let won = channel
            .capture(
                &session.id,
                RawRequest {
                    method: "GET".to_string(),
                    path: "/callback".to_string(),
                    query: "code=A&state=B".to_string(),
                    headers: vec![],
                    body: vec![],
                },
            )
            .await
            .unwrap();
        assert!(won);

        let data = channel.get_data(&session.id).await.unwrap().unwrap();
        assert_eq!(data.query, "code=A&state=B");
        assert!(channel.is_received(&session.id).await.unwrap());

        channel.delete(&session.id).await;
        assert!(channel.get_data(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_capture_does_not_mutate_snapshot_s2() {
        let channel = channel();
        let session = channel
            .register(8765, "/callback", Duration::from_secs(120))
            .await
            .unwrap();

        channel
            .capture(
                &session.id,
                RawRequest {
                    method: "GET".to_string(),
                    path: "/callback".to_string(),
                    query: "code=A&state=B".to_string(),
                    headers: vec![],
                    body: vec![],
                },
            )
            .await
            .unwrap();

        let second = channel
            .capture(
                &session.id,
                RawRequest {
                    method: "GET".to_string(),
                    path: "/callback".to_string(),
                    query: "code=DIFFERENT".to_string(),
                    headers: vec![],
                    body: vec![],
                },
            )
            .await
            .unwrap();
        assert!(!second);

        let data = channel.get_data(&session.id).await.unwrap().unwrap();
        assert_eq!(data.query, "code=A&state=B");
    }

    #[tokio::test]
    async fn capture_strips_denied_headers() {
        let channel = channel();
        let session = channel
            .register(8765, "/callback", Duration::from_secs(120))
            .await
            .unwrap();
        channel
            .capture(
                &session.id,
                RawRequest {
                    method: "GET".to_string(),
                    path: "/callback".to_string(),
                    query: String::new(),
                    headers: vec![
                        ("Cookie".to_string(), "secret".to_string()),
                        ("X-Trace-Id".to_string(), "abc".to_string()),
                    ],
                    body: vec![],
                },
            )
            .await
            .unwrap();
        let data = channel.get_data(&session.id).await.unwrap().unwrap();
        assert!(!data.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("cookie")));
        assert!(data.headers.iter().any(|(k, _)| k == "X-Trace-Id"));
    }

    #[tokio::test]
    async fn capture_truncates_oversize_body() {
        let channel = channel();
        let session = channel
            .register(8765, "/callback", Duration::from_secs(120))
            .await
            .unwrap();
        channel
            .capture(
                &session.id,
                RawRequest {
                    method: "POST".to_string(),
                    path: "/callback".to_string(),
                    query: String::new(),
                    headers: vec![],
                    body: vec![0u8; MAX_CALLBACK_BODY * 2],
                },
            )
            .await
            .unwrap();
        let data = channel.get_data(&session.id).await.unwrap().unwrap();
        assert_eq!(data.body.len(), MAX_CALLBACK_BODY);
    }

    #[tokio::test]
    async fn register_rejects_ttl_over_max() {
        let channel = channel();
        assert!(channel
            .register(8765, "/callback", Duration::from_secs(3600))
            .await
            .is_err());
    }
}
