/**
 * Copyright (c) 2024-2025 Relay, Inc.
 *
 * This file is part of Relay Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecursiveMode, Watcher};
use parking_lot::RwLock;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::loader;
use crate::config::ProxyConfig;
use crate::events;
use crate::store::ConfigStore;

pub type ReloadCallback = Arc<dyn Fn(&Arc<ProxyConfig>) + Send + Sync>;

#[derive(Debug, Error, PartialEq)]
pub enum WatcherError {
    #[error("watcher already closed")]
    Closed,
}

/// Watches the config file and republishes it on change.
///
/// The watch sits on the parent directory so editors that replace the file
/// via rename are still seen; events are filtered down to the configured
/// file name and coalesced through a trailing-edge debounce window. A reload
/// that fails validation is logged and the previous config stays live.
///
/// Network-mounted filesystems may never deliver change events; on such
/// mounts a config change only takes effect on restart.
pub struct ConfigWatcher {
    path: PathBuf,
    store: Arc<ConfigStore>,
    callbacks: RwLock<Vec<ReloadCallback>>,
    debounce: Duration,
    closed: AtomicBool,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, store: Arc<ConfigStore>, debounce: Duration) -> Self {
        ConfigWatcher {
            path,
            store,
            callbacks: RwLock::new(Vec::new()),
            debounce,
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a callback run on every successful reload, in registration
    /// order, before the new config is published to the store.
    pub fn on_reload(&self, callback: ReloadCallback) {
        self.callbacks.write().push(callback);
    }

    /// Stops dispatching reloads. A second close reports the sentinel
    /// instead of panicking.
    pub fn close(&self) -> Result<(), WatcherError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            Err(WatcherError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // trailing edge of the debounce window
    fn reload_once(&self) {
        match loader::load(&self.path) {
            Ok(config) => {
                let config = Arc::new(config);
                let callbacks: Vec<ReloadCallback> = self.callbacks.read().clone();
                for callback in callbacks {
                    callback(&config);
                }
                self.store.replace(config);
                events::reload(true, &self.path.display().to_string());
            }
            Err(error) => {
                // keep serving the previous config
                events::reload(false, &error.to_string());
            }
        }
    }
}

#[async_trait]
impl BackgroundService for ConfigWatcher {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = match self.path.file_name() {
            Some(name) => name.to_os_string(),
            None => {
                warn!("config path {:?} has no file name, watcher disabled", self.path);
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let filter_name = file_name.clone();
        let mut fs_watcher =
            match notify::recommended_watcher(move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    if is_relevant(&event, &filter_name) {
                        // a full channel already has a wakeup pending
                        let _ = tx.try_send(());
                    }
                }
            }) {
                Ok(watcher) => watcher,
                Err(error) => {
                    warn!("config watcher failed to start: {}", error);
                    return;
                }
            };
        if let Err(error) = fs_watcher.watch(&parent, RecursiveMode::NonRecursive) {
            warn!("config watcher cannot watch {:?}: {}", parent, error);
            return;
        }

        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            if let Some(at) = deadline {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Some(()) => deadline = Some(tokio::time::Instant::now() + self.debounce),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        // the pending dispatch must not fire into a
                        // torn-down watcher
                        if self.is_closed() || *shutdown.borrow() {
                            break;
                        }
                        self.reload_once();
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Some(()) => deadline = Some(tokio::time::Instant::now() + self.debounce),
                        None => break,
                    },
                }
            }
        }
        let _ = self.close();
    }
}

// drop metadata-only noise, keep anything that names the config file
fn is_relevant(event: &Event, file_name: &OsStr) -> bool {
    match event.kind {
        EventKind::Access(_) => false,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        _ => event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const CONFIG_V1: &str = r#"
server:
  bind: "127.0.0.1:1000"
  auth:
    anonymous: true
"#;

    const CONFIG_V2: &str = r#"
server:
  bind: "127.0.0.1:2000"
  auth:
    anonymous: true
"#;

    fn seeded(dir: &tempfile::TempDir, text: &str) -> (PathBuf, Arc<ConfigStore>) {
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, text).unwrap();
        let config = Arc::new(loader::load(&path).unwrap());
        (path, Arc::new(ConfigStore::new(config)))
    }

    fn spawn(watcher: Arc<ConfigWatcher>) -> (tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { watcher.start(rx).await });
        (tx, handle)
    }

    #[test]
    fn close_twice_reports_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (path, store) = seeded(&dir, CONFIG_V1);
        let watcher = ConfigWatcher::new(path, store, Duration::from_millis(100));
        assert_eq!(watcher.close(), Ok(()));
        assert_eq!(watcher.close(), Err(WatcherError::Closed));
    }

    #[test]
    fn metadata_events_are_ignored() {
        use notify::event::MetadataKind;
        let touch = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(PathBuf::from("/etc/relay.yaml"));
        assert!(!is_relevant(&touch, OsStr::new("relay.yaml")));

        let write = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/relay.yaml"));
        assert!(is_relevant(&write, OsStr::new("relay.yaml")));

        let sibling = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/other.yaml"));
        assert!(!is_relevant(&sibling, OsStr::new("relay.yaml")));
    }

    #[tokio::test]
    async fn a_burst_of_writes_coalesces_into_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (path, store) = seeded(&dir, CONFIG_V1);
        let watcher = Arc::new(ConfigWatcher::new(
            path.clone(),
            store.clone(),
            Duration::from_millis(100),
        ));
        let reloads = Arc::new(AtomicUsize::new(0));
        {
            let reloads = reloads.clone();
            watcher.on_reload(Arc::new(move |_| {
                reloads.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let (shutdown, handle) = spawn(watcher.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // several writes inside one debounce window
        for _ in 0..4 {
            std::fs::write(&path, CONFIG_V1).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::write(&path, CONFIG_V2).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // exactly one trailing-edge reload, observing the final contents
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().server.bind, "127.0.0.1:2000");

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_broken_replacement_keeps_the_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let (path, store) = seeded(&dir, CONFIG_V1);
        let watcher = Arc::new(ConfigWatcher::new(
            path.clone(),
            store.clone(),
            Duration::from_millis(50),
        ));
        let (shutdown, handle) = spawn(watcher.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(&path, "server: [nonsense").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get().server.bind, "127.0.0.1:1000");

        // and a good write afterwards still lands
        std::fs::write(&path, CONFIG_V2).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get().server.bind, "127.0.0.1:2000");

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order_before_publication() {
        let dir = tempfile::tempdir().unwrap();
        let (path, store) = seeded(&dir, CONFIG_V1);
        let watcher = Arc::new(ConfigWatcher::new(
            path.clone(),
            store.clone(),
            Duration::from_millis(50),
        ));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            let store = store.clone();
            watcher.on_reload(Arc::new(move |_| {
                // the store still holds the old config while callbacks run
                assert_eq!(store.get().server.bind, "127.0.0.1:1000");
                order.lock().push(tag);
            }));
        }
        let (shutdown, handle) = spawn(watcher.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(&path, CONFIG_V2).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(store.get().server.bind, "127.0.0.1:2000");

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_the_loop_within_a_debounce_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (path, store) = seeded(&dir, CONFIG_V1);
        let watcher = Arc::new(ConfigWatcher::new(path, store, Duration::from_millis(50)));
        let (shutdown, handle) = spawn(watcher.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("watcher loop should exit promptly")
            .unwrap();
        assert!(watcher.is_closed());
    }
}
