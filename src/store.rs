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

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::ProxyConfig;

/// Holds the live configuration.
///
/// Readers get an `Arc` snapshot and keep using it for as long as they like;
/// a replacement never invalidates a snapshot captured before the swap.
/// In-flight requests therefore finish on the config they started with.
pub struct ConfigStore {
    inner: ArcSwap<ProxyConfig>,
}

impl ConfigStore {
    pub fn new(initial: Arc<ProxyConfig>) -> Self {
        ConfigStore {
            inner: ArcSwap::new(initial),
        }
    }

    /// Wait-free read of the current config.
    pub fn get(&self) -> Arc<ProxyConfig> {
        self.inner.load_full()
    }

    /// Atomically publishes a replacement config.
    pub fn replace(&self, next: Arc<ProxyConfig>) {
        self.inner.store(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_bind(bind: &str) -> Arc<ProxyConfig> {
        let mut config = ProxyConfig::default();
        config.server.bind = bind.to_string();
        Arc::new(config)
    }

    #[test]
    fn replace_is_visible_to_later_readers() {
        let store = ConfigStore::new(config_with_bind("127.0.0.1:1000"));
        store.replace(config_with_bind("127.0.0.1:2000"));
        assert_eq!(store.get().server.bind, "127.0.0.1:2000");
    }

    #[test]
    fn captured_snapshot_survives_a_swap() {
        let store = ConfigStore::new(config_with_bind("127.0.0.1:1000"));
        let before = store.get();
        store.replace(config_with_bind("127.0.0.1:2000"));
        // the earlier snapshot is still the pre-swap value, not a mix
        assert_eq!(before.server.bind, "127.0.0.1:1000");
        assert_eq!(store.get().server.bind, "127.0.0.1:2000");
    }

    #[test]
    fn concurrent_readers_see_whole_configs() {
        let store = Arc::new(ConfigStore::new(config_with_bind("127.0.0.1:1000")));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    store.replace(config_with_bind(&format!("127.0.0.1:{}", 1000 + i)));
                }
            })
        };
        for _ in 0..1000 {
            let snapshot = store.get();
            assert!(snapshot.server.bind.starts_with("127.0.0.1:"));
        }
        writer.join().unwrap();
    }
}
