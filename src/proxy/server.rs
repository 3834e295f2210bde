//! Host Proxy Server: owns the router, session store, callback channel,
//! and dynamic-listener table. Idempotent start/stop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::constants::SERVER_SHUTDOWN_BUDGET;
use crate::error::{ClawkerError, Result};
use crate::session::{CallbackChannel, SessionStore};

use super::listeners::DynamicListeners;
use super::router::{build_router, AppState};

struct BoundListener {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Owns the main-router listeners, the session store, the callback
/// channel, and the dynamic-listener table.
pub struct Server {
    pub store: Arc<SessionStore>,
    pub callback: Arc<CallbackChannel>,
    pub listeners: Arc<DynamicListeners>,
    port: u16,
    running: AtomicBool,
    main_listeners: Mutex<Vec<BoundListener>>,
}

impl Server {
    pub async fn new(config: &Config) -> Arc<Self> {
        let store = SessionStore::new();
        let callback = Arc::new(CallbackChannel::new(
            Arc::clone(&store),
            config.callback_ttl(),
            config.max_callback_ttl(),
        ));
        let listeners = DynamicListeners::new(Arc::clone(&callback));

        let server = Arc::new(Self {
            store: Arc::clone(&store),
            callback,
            listeners: Arc::clone(&listeners),
            port: config.port,
            running: AtomicBool::new(false),
            main_listeners: Mutex::new(Vec::new()),
        });

        // Wire the deletion hook: a callback session's removal tears down
        // its dynamic listener, if any. The hook itself is synchronous (the
        // store invariant forbids re-entering the store under its own
        // lock), so it hands off to a spawned task to do the async
        // listener teardown.
        let hook_listeners = Arc::clone(&listeners);
        let hook_rt = tokio::runtime::Handle::current();
        let hook: crate::session::DeletionHook = Arc::new(move |session| {
            let listeners = Arc::clone(&hook_listeners);
            let id = session.id.clone();
            hook_rt.spawn(async move {
                listeners.unregister_for_session(&id).await;
            });
        });
        store.set_deletion_hook(hook).await;

        server
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            callback: Arc::clone(&self.callback),
            store: Arc::clone(&self.store),
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Idempotent: re-entry while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let router = build_router(self.app_state());
        let mut bound = Vec::new();

        let v4_addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        let v4_listener = TcpListener::bind(v4_addr)
            .await
            .map_err(|e| ClawkerError::Fatal(format!("binding {v4_addr}: {e}")))?;
        bound.push(spawn_serve(v4_listener, router.clone()));

        let v6_addr: SocketAddr = ([0, 0, 0, 0, 0, 0, 0, 1], self.port).into();
        match TcpListener::bind(v6_addr).await {
            Ok(v6_listener) => bound.push(spawn_serve(v6_listener, router.clone())),
            Err(e) => log::warn!("IPv6 bind on {v6_addr} failed (continuing on IPv4 only): {e}"),
        }

        *self.main_listeners.lock().await = bound;
        Ok(())
    }

    /// Idempotent. Stops accepting new registrations, closes every dynamic
    /// listener, stops the session store, then gracefully drains the main
    /// listener(s) within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.listeners.stop_all().await;
        self.store.stop();

        let bound = std::mem::take(&mut *self.main_listeners.lock().await);
        for listener in bound {
            listener.shutdown.notify_one();
            let _ = tokio::time::timeout(timeout, listener.join).await;
        }
        Ok(())
    }

    pub async fn stop_default(&self) -> Result<()> {
        self.stop(SERVER_SHUTDOWN_BUDGET).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn spawn_serve(listener: TcpListener, router: axum::Router) -> BoundListener {
    let shutdown = Arc::new(Notify::new());
    let task_shutdown = Arc::clone(&shutdown);
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                task_shutdown.notified().await;
            })
            .await;
    });
    BoundListener { shutdown, join }
}
