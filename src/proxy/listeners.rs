//! Dynamic Listeners: one TCP listener per registered callback session,
//! bound to the caller-chosen port, torn down via the session store's
//! deletion hook.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Html;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::constants::LISTENER_SHUTDOWN_GRACE;
use crate::error::{ClawkerError, Result};
use crate::session::CallbackChannel;

use super::handlers::handle_browser_callback;

struct ListenerHandle {
    session_id: String,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Owns the `port -> listener` table on behalf of the Host Proxy Server.
pub struct DynamicListeners {
    callback: Arc<CallbackChannel>,
    listeners: Mutex<HashMap<u32, ListenerHandle>>,
}

impl DynamicListeners {
    pub fn new(callback: Arc<CallbackChannel>) -> Arc<Self> {
        Arc::new(Self {
            callback,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Binds a fresh TCP listener on `127.0.0.1:port` with a catch-all
    /// handler that resolves to `session_id` regardless of request path.
    /// Fails cleanly if a listener already exists on that port — no two
    /// dynamic listeners may coexist on the same port.
    pub async fn register(&self, session_id: String, port: u32) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&port) {
            return Err(ClawkerError::validation(format!(
                "a dynamic listener is already bound on port {port}"
            )));
        }

        let addr: SocketAddr = format!("127.0.0.1:{port}")
            .parse()
            .map_err(|_| ClawkerError::validation(format!("invalid port {port}")))?;
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClawkerError::validation(format!("binding port {port}: {e}")))?;

        let app = Router::new()
            .fallback(any(catch_all))
            .with_state(CallbackOnlyState {
                callback: Arc::clone(&self.callback),
                session_id: session_id.clone(),
            });

        let shutdown = Arc::new(Notify::new());
        let task_shutdown = Arc::clone(&shutdown);
        let join = tokio::spawn(async move {
            let _ = axum::serve(tcp_listener, app)
                .with_graceful_shutdown(async move {
                    task_shutdown.notified().await;
                })
                .await;
        });

        listeners.insert(
            port,
            ListenerHandle {
                session_id,
                shutdown,
                join,
            },
        );
        Ok(())
    }

    /// Tears down whichever listener (if any) serves `session_id`.
    pub async fn unregister_for_session(&self, session_id: &str) {
        let port = {
            let listeners = self.listeners.lock().await;
            listeners
                .iter()
                .find(|(_, h)| h.session_id == session_id)
                .map(|(port, _)| *port)
        };
        if let Some(port) = port {
            self.unregister_port(port).await;
        }
    }

    async fn unregister_port(&self, port: u32) {
        let handle = self.listeners.lock().await.remove(&port);
        if let Some(handle) = handle {
            handle.shutdown.notify_one();
            let _ = tokio::time::timeout(LISTENER_SHUTDOWN_GRACE, handle.join).await;
        }
    }

    /// Closes every dynamic listener. Called by `Server::stop`.
    pub async fn stop_all(&self) {
        let ports: Vec<u32> = self.listeners.lock().await.keys().copied().collect();
        for port in ports {
            self.unregister_port(port).await;
        }
    }

    #[cfg(test)]
    pub async fn port_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

#[derive(Clone)]
struct CallbackOnlyState {
    callback: Arc<CallbackChannel>,
    session_id: String,
}

async fn catch_all(
    State(state): State<CallbackOnlyState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Html<String> {
    handle_browser_callback(
        &state.callback,
        &state.session_id,
        method.as_str(),
        uri.path(),
        query.unwrap_or_default(),
        headers,
        body.to_vec(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use std::time::Duration;

    fn channel() -> Arc<CallbackChannel> {
        Arc::new(CallbackChannel::new(
            SessionStore::new(),
            Duration::from_secs(300),
            Duration::from_secs(1800),
        ))
    }

    #[tokio::test]
    async fn cannot_register_two_listeners_on_same_port() {
        let callback = channel();
        let listeners = DynamicListeners::new(Arc::clone(&callback));
        let session = callback
            .register(18901, "/callback", Duration::from_secs(60))
            .await
            .unwrap();
        listeners
            .register(session.id.clone(), 18901)
            .await
            .unwrap();

        let second = listeners.register("other-session".to_string(), 18901).await;
        assert!(second.is_err());
        listeners.stop_all().await;
    }

    #[tokio::test]
    async fn port_is_released_after_unregister() {
        let callback = channel();
        let listeners = DynamicListeners::new(Arc::clone(&callback));
        let session = callback
            .register(18902, "/callback", Duration::from_secs(60))
            .await
            .unwrap();
        listeners
            .register(session.id.clone(), 18902)
            .await
            .unwrap();
        assert_eq!(listeners.port_count().await, 1);

        listeners.unregister_for_session(&session.id).await;
        assert_eq!(listeners.port_count().await, 0);

        // The port must be truly free: re-binding must succeed.
        let rebound = tokio::net::TcpListener::bind("127.0.0.1:18902").await;
        assert!(rebound.is_ok());
    }
}
