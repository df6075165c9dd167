//! Liveness polling of external applications.
//!
//! Every tick each registered handle is probed. A handle that becomes
//! reachable must also pass its handshake before it counts as connected;
//! a handle that stops answering is marked disconnected and listeners are
//! told. Probe failures count as "disconnected" and never stop the loop.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notification::{LifecycleEvent, Notification, Notifier};

/// A peer the editor can talk to.
#[async_trait]
pub trait ExternalApplication: Send + Sync {
    fn id(&self) -> &str;

    /// Liveness probe.
    async fn is_connected(&self) -> anyhow::Result<bool>;

    /// Handshake run once when the peer becomes reachable. `Ok(false)` keeps
    /// it disconnected.
    async fn on_connect(&self) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connected(&self, id: &str);
    async fn on_disconnected(&self, id: &str);
}

pub struct ConnectionManager {
    handles: DashMap<String, Arc<dyn ExternalApplication>>,
    connected: DashMap<String, bool>,
    /// Handles whose sweep has not finished yet.
    updating: DashSet<String>,
    ever_connected: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    notifier: Arc<dyn Notifier>,
    connect_backoff: Duration,
    polling: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(notifier: Arc<dyn Notifier>, connect_backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            handles: DashMap::new(),
            connected: DashMap::new(),
            updating: DashSet::new(),
            ever_connected: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            notifier,
            connect_backoff,
            polling: Mutex::new(None),
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn ConnectionListener>) {
        if let Ok(mut l) = self.listeners.lock() {
            l.push(listener);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Start tracking `handle`; it starts out disconnected.
    pub fn register(&self, handle: Arc<dyn ExternalApplication>) {
        let id = handle.id().to_string();
        debug!(%id, "external application registered");
        self.connected.insert(id.clone(), false);
        self.handles.insert(id, handle);
    }

    /// Stop tracking `id`. No hooks are called.
    pub fn unregister(&self, id: &str) -> bool {
        self.connected.remove(id);
        self.handles.remove(id).is_some()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connected.get(id).is_some_and(|c| *c)
    }

    pub fn any_connected(&self) -> bool {
        self.connected.iter().any(|c| *c.value())
    }

    pub fn is_polling(&self) -> bool {
        self.polling.lock().is_ok_and(|p| p.is_some())
    }

    /// Poll every `interval` until [`stop_polling`](Self::stop_polling). A
    /// second call while polling only logs a warning.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let token = {
            let Ok(mut polling) = self.polling.lock() else {
                return;
            };
            if polling.is_some() {
                warn!("connection polling already started");
                return;
            }
            let token = CancellationToken::new();
            *polling = Some(token.clone());
            token
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            info!(?interval, "connection polling started");
            loop {
                let Some(this) = weak.upgrade() else { break };
                this.sweep().await;
                let wait = if this.ever_connected.load(Ordering::SeqCst) {
                    interval
                } else {
                    this.connect_backoff
                };
                drop(this);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            debug!("connection polling stopped");
        });
    }

    pub fn stop_polling(&self) {
        if let Ok(mut polling) = self.polling.lock() {
            if let Some(token) = polling.take() {
                token.cancel();
            }
        }
    }

    /// One pass over every handle, concurrently.
    pub async fn sweep(&self) {
        let ids: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        join_all(ids.iter().map(|id| self.refresh(id))).await;
    }

    /// Probe one handle now. `None` when it is unknown or its previous sweep
    /// is still running, otherwise its connectedness afterwards.
    pub async fn refresh(&self, id: &str) -> Option<bool> {
        let handle = self.handles.get(id).map(|h| h.value().clone())?;
        if !self.updating.insert(id.to_string()) {
            return None;
        }
        let state = self.update(id, handle).await;
        self.updating.remove(id);
        Some(state)
    }

    async fn update(&self, id: &str, handle: Arc<dyn ExternalApplication>) -> bool {
        let was = self.is_connected(id);
        let alive = match handle.is_connected().await {
            Ok(alive) => alive,
            Err(e) => {
                debug!(%id, "liveness probe failed: {e:#}");
                false
            }
        };

        match (was, alive) {
            (true, true) => true,
            (false, false) => false,
            (true, false) => {
                self.mark(id, false);
                self.notifier.notify(
                    Notification::warning(LifecycleEvent::Disconnected, "External application disconnected")
                        .detail(id),
                );
                for l in self.listeners() {
                    l.on_disconnected(id).await;
                }
                false
            }
            (false, true) => match handle.on_connect().await {
                Ok(true) => {
                    self.mark(id, true);
                    self.ever_connected.store(true, Ordering::SeqCst);
                    info!(%id, "external application connected");
                    for l in self.listeners() {
                        l.on_connected(id).await;
                    }
                    true
                }
                Ok(false) => {
                    debug!(%id, "handshake refused");
                    false
                }
                Err(e) => {
                    warn!(%id, "handshake failed: {e:#}");
                    false
                }
            },
        }
    }

    fn mark(&self, id: &str, connected: bool) {
        // the handle may have been unregistered while it was probed
        if self.handles.contains_key(id) {
            self.connected.insert(id.to_string(), connected);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::MemoryNotifier;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct FakeApp {
        id: String,
        alive: AtomicBool,
        handshake: AtomicBool,
        probe_fails: AtomicBool,
        probes: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl FakeApp {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                alive: AtomicBool::new(false),
                handshake: AtomicBool::new(true),
                probe_fails: AtomicBool::new(false),
                probes: AtomicUsize::new(0),
                gate: None,
            })
        }
    }

    #[async_trait]
    impl ExternalApplication for FakeApp {
        fn id(&self) -> &str {
            &self.id
        }

        async fn is_connected(&self) -> anyhow::Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.probe_fails.load(Ordering::SeqCst) {
                anyhow::bail!("socket refused");
            }
            Ok(self.alive.load(Ordering::SeqCst))
        }

        async fn on_connect(&self) -> anyhow::Result<bool> {
            Ok(self.handshake.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct Hooks {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionListener for Hooks {
        async fn on_connected(&self, _id: &str) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_disconnected(&self, _id: &str) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (Arc<ConnectionManager>, Arc<Hooks>, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let mgr = ConnectionManager::new(notifier.clone(), Duration::from_millis(5));
        let hooks = Arc::new(Hooks::default());
        mgr.subscribe(hooks.clone());
        (mgr, hooks, notifier)
    }

    #[tokio::test]
    async fn successful_handshake_connects_once() {
        let (mgr, hooks, _) = manager();
        let app = FakeApp::new("backend");
        mgr.register(app.clone());

        assert_eq!(mgr.refresh("backend").await, Some(false));
        app.alive.store(true, Ordering::SeqCst);
        assert_eq!(mgr.refresh("backend").await, Some(true));
        assert_eq!(mgr.refresh("backend").await, Some(true));

        assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);
        assert!(mgr.is_connected("backend"));
        assert!(mgr.any_connected());
    }

    #[tokio::test]
    async fn refused_handshake_stays_disconnected() {
        let (mgr, hooks, _) = manager();
        let app = FakeApp::new("backend");
        app.alive.store(true, Ordering::SeqCst);
        app.handshake.store(false, Ordering::SeqCst);
        mgr.register(app);

        assert_eq!(mgr.refresh("backend").await, Some(false));
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 0);
        assert!(!mgr.is_connected("backend"));
    }

    #[tokio::test]
    async fn losing_the_peer_notifies_and_fires_hook() {
        let (mgr, hooks, notifier) = manager();
        let app = FakeApp::new("backend");
        app.alive.store(true, Ordering::SeqCst);
        mgr.register(app.clone());
        mgr.refresh("backend").await;

        app.probe_fails.store(true, Ordering::SeqCst);
        assert_eq!(mgr.refresh("backend").await, Some(false));
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.count(LifecycleEvent::Disconnected), 1);

        // already disconnected: nothing new
        mgr.refresh("backend").await;
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_is_not_swept_twice_at_once() {
        let (mgr, _, _) = manager();
        let gate = Arc::new(Notify::new());
        let app = Arc::new(FakeApp {
            id: "slow".into(),
            alive: AtomicBool::new(true),
            handshake: AtomicBool::new(true),
            probe_fails: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        mgr.register(app.clone());

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.refresh("slow").await })
        };
        while app.probes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mgr.refresh("slow").await, None);
        gate.notify_one();
        assert_eq!(first.await.unwrap(), Some(true));
        assert_eq!(app.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_and_unregistered_handles() {
        let (mgr, _, _) = manager();
        assert_eq!(mgr.refresh("nobody").await, None);
        mgr.register(FakeApp::new("a"));
        assert!(mgr.unregister("a"));
        assert!(!mgr.unregister("a"));
        assert!(!mgr.is_registered("a"));
    }

    #[tokio::test]
    async fn polling_picks_up_a_peer() {
        let (mgr, hooks, _) = manager();
        let app = FakeApp::new("backend");
        mgr.register(app.clone());
        mgr.start_polling(Duration::from_millis(5));
        mgr.start_polling(Duration::from_millis(5));
        assert!(mgr.is_polling());

        app.alive.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !mgr.is_connected("backend") {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);

        mgr.stop_polling();
        assert!(!mgr.is_polling());
    }
}
