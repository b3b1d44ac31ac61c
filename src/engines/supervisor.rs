//! Engine supervisor: the registry of live workers.
//!
//! Keys workers by (user, kind), spawns them with a cancellation handle,
//! and broadcasts every state transition for the WebSocket fan-out. `stop`
//! is fire-and-forget; a key reports stopped only once its worker has
//! actually returned.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::models::WsServerEvent;

/// Scope key for the global (non-per-user) engines.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Copy,
    Arb,
    Fund,
    Positions,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Copy => "copy",
            EngineKind::Arb => "arb",
            EngineKind::Fund => "fund",
            EngineKind::Positions => "positions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub user_address: String,
    pub kind: EngineKind,
}

impl EngineKey {
    pub fn new(user_address: &str, kind: EngineKind) -> Self {
        Self {
            user_address: user_address.to_lowercase(),
            kind,
        }
    }

    pub fn global(kind: EngineKind) -> Self {
        Self::new(GLOBAL_SCOPE, kind)
    }
}

struct WorkerHandle {
    cancel: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Supervisor {
    workers: Arc<Mutex<HashMap<EngineKey, WorkerHandle>>>,
    events: broadcast::Sender<WsServerEvent>,
}

impl Supervisor {
    pub fn new(events: broadcast::Sender<WsServerEvent>) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Spawn a worker under a key. Idempotent: returns false without
    /// spawning when a live worker already holds the key.
    pub fn start<F, Fut>(&self, key: EngineKey, factory: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut workers = self.workers.lock();
            if workers.contains_key(&key) {
                return false;
            }
            workers.insert(key.clone(), WorkerHandle { cancel: cancel_tx });
        }

        let join = tokio::spawn(factory(cancel_rx));
        self.broadcast(&key, "running");
        info!(
            user = %key.user_address,
            engine = key.kind.as_str(),
            "engine started"
        );

        // The key flips to stopped only when the worker future returns,
        // whether through cancellation or a terminal failure.
        let supervisor = self.clone();
        let monitor_key = key;
        tokio::spawn(async move {
            let _ = join.await;
            supervisor.workers.lock().remove(&monitor_key);
            supervisor.broadcast(&monitor_key, "stopped");
            info!(
                user = %monitor_key.user_address,
                engine = monitor_key.kind.as_str(),
                "engine stopped"
            );
        });
        true
    }

    /// Signal cancellation. Returns promptly without awaiting teardown;
    /// false when no worker holds the key.
    pub fn stop(&self, key: &EngineKey) -> bool {
        let workers = self.workers.lock();
        match workers.get(key) {
            Some(handle) => handle.cancel.send(true).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self, key: &EngineKey) -> bool {
        self.workers.lock().contains_key(key)
    }

    /// Snapshot of all live keys.
    pub fn snapshot(&self) -> Vec<EngineKey> {
        self.workers.lock().keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsServerEvent> {
        self.events.subscribe()
    }

    fn broadcast(&self, key: &EngineKey, state: &str) {
        let _ = self.events.send(WsServerEvent::EngineStatus {
            user_address: key.user_address.clone(),
            engine: key.kind.as_str().to_string(),
            state: state.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn supervisor() -> Supervisor {
        let (tx, _rx) = broadcast::channel(64);
        Supervisor::new(tx)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let sup = supervisor();
        let key = EngineKey::new("0xU", EngineKind::Copy);

        assert!(sup.start(key.clone(), |mut cancel| async move {
            let _ = cancel.changed().await;
        }));
        assert!(sup.is_running(&key));

        // Second start with a live worker is refused.
        assert!(!sup.start(key.clone(), |_| async {}));

        sup.stop(&key);
    }

    #[tokio::test]
    async fn test_stop_transitions_after_worker_returns() {
        let sup = supervisor();
        let key = EngineKey::new("0xu", EngineKind::Arb);
        let mut events = sup.subscribe();

        sup.start(key.clone(), |mut cancel| async move {
            let _ = cancel.changed().await;
        });
        assert!(sup.stop(&key));

        // Wait for the monitor to observe worker exit.
        tokio::time::timeout(Duration::from_secs(1), async {
            while sup.is_running(&key) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should stop within the timeout");

        // Both transitions were broadcast.
        let first = events.recv().await.unwrap();
        let WsServerEvent::EngineStatus { state, .. } = first;
        assert_eq!(state, "running");
        let second = events.recv().await.unwrap();
        let WsServerEvent::EngineStatus { state, .. } = second;
        assert_eq!(state, "stopped");
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_noop() {
        let sup = supervisor();
        assert!(!sup.stop(&EngineKey::global(EngineKind::Fund)));
    }

    #[tokio::test]
    async fn test_key_restartable_after_exit() {
        let sup = supervisor();
        let key = EngineKey::new("0xu", EngineKind::Copy);

        sup.start(key.clone(), |_| async {});
        tokio::time::timeout(Duration::from_secs(1), async {
            while sup.is_running(&key) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(sup.start(key.clone(), |mut cancel| async move {
            let _ = cancel.changed().await;
        }));
        sup.stop(&key);
    }
}
