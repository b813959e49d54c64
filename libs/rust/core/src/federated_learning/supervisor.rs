//! Long-lived loop tasks keyed by index, at most one per key.
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ledgerfl_resilience::StopFlag;

struct Listener {
    stop: StopFlag,
    handle: JoinHandle<()>,
}

pub struct ListenerSupervisor {
    listeners: Mutex<HashMap<String, Listener>>,
    join_timeout: Duration,
}

impl ListenerSupervisor {
    pub fn new(join_timeout: Duration) -> Self {
        Self { listeners: Mutex::new(HashMap::new()), join_timeout }
    }

    async fn shutdown(&self, key: &str, mut old: Listener) {
        old.stop.stop();
        if tokio::time::timeout(self.join_timeout, &mut old.handle).await.is_err() {
            warn!(%key, timeout_ms = self.join_timeout.as_millis() as u64, "listener did not stop in time; aborting");
            old.handle.abort();
        }
    }

    /// Stops and joins the task under `key` (bounded), then starts a new one.
    pub async fn replace<F, Fut>(&self, key: &str, start: F)
    where
        F: FnOnce(StopFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut map = self.listeners.lock().await;
        if let Some(old) = map.remove(key) {
            info!(%key, "stopping previous listener");
            self.shutdown(key, old).await;
        }
        let stop = StopFlag::new();
        let handle = tokio::spawn(start(stop.clone()));
        map.insert(key.to_string(), Listener { stop, handle });
    }

    /// Starts a task under `key` unless one is still running; returns whether it started.
    pub async fn start_if_idle<F, Fut>(&self, key: &str, start: F) -> bool
    where
        F: FnOnce(StopFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut map = self.listeners.lock().await;
        if map.get(key).is_some_and(|l| !l.handle.is_finished()) {
            return false;
        }
        let stop = StopFlag::new();
        let handle = tokio::spawn(start(stop.clone()));
        map.insert(key.to_string(), Listener { stop, handle });
        true
    }

    /// Signals the task under `key` to stop without waiting for it.
    pub async fn signal(&self, key: &str) -> bool {
        match self.listeners.lock().await.get(key) {
            Some(l) if !l.handle.is_finished() => {
                l.stop.stop();
                true
            }
            _ => false,
        }
    }

    pub async fn is_running(&self, key: &str) -> bool {
        self.listeners.lock().await.get(key).is_some_and(|l| !l.handle.is_finished())
    }

    /// Waits until the task under `key` has finished, polling every `interval`.
    pub async fn wait_idle(&self, key: &str, interval: Duration) {
        while self.is_running(key).await {
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, Listener)> = self.listeners.lock().await.drain().collect();
        for (key, listener) in drained {
            self.shutdown(&key, listener).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn replace_stops_previous_listener() {
        let sup = ListenerSupervisor::new(Duration::from_millis(200));
        let exits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let exits = exits.clone();
            sup.replace("demo", move |stop| async move {
                while !stop.is_stopped() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                exits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert!(sup.is_running("demo").await);
        sup.stop_all().await;
        assert_eq!(exits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stubborn_listener_is_aborted() {
        let sup = ListenerSupervisor::new(Duration::from_millis(10));
        sup.replace("demo", |_stop| async { tokio::time::sleep(Duration::from_secs(60)).await }).await;
        let started = std::time::Instant::now();
        sup.replace("demo", |_stop| async {}).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn start_if_idle_refuses_second_session() {
        let sup = ListenerSupervisor::new(Duration::from_millis(50));
        assert!(sup.start_if_idle("demo", |stop| async move {
            while !stop.is_stopped() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }).await);
        assert!(!sup.start_if_idle("demo", |_stop| async {}).await);
        assert!(sup.signal("demo").await);
        sup.wait_idle("demo", Duration::from_millis(2)).await;
        assert!(sup.start_if_idle("demo", |_stop| async {}).await);
    }
}
