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

mod auth;
mod breaker;
mod config;
mod events;
mod limiter;
mod pool;
mod provider;
mod proxy;
mod response;
mod secret;
mod store;
mod strategy;
mod watcher;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use pingora::prelude::Opt;
use pingora::proxy::http_proxy_service;
use pingora::server::Server;
use pingora::services::background::background_service;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::breaker::BreakerReaper;
use crate::config::LoggingConfig;
use crate::provider::{Registry, RegistryHandle};
use crate::proxy::ProxyRouter;
use crate::store::ConfigStore;
use crate::watcher::ConfigWatcher;

// explicit override, then the working directory, then the user config dir
fn resolve_config_path() -> PathBuf {
    if let Ok(path) = env::var("RELAY_CONF") {
        return PathBuf::from(path);
    }
    let local = PathBuf::from("relay.yaml");
    if local.exists() {
        return local;
    }
    if let Ok(dir) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(dir).join("relay/relay.yaml");
        if candidate.exists() {
            return candidate;
        }
    }
    if let Ok(home) = env::var("HOME") {
        let candidate = PathBuf::from(home).join(".config/relay/relay.yaml");
        if candidate.exists() {
            return candidate;
        }
    }
    local
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn main() {
    // load and validate before anything else; a broken config aborts with
    // the full diagnostic report
    let config_path = resolve_config_path();
    let initial = match config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("relay: {}", error);
            process::exit(1);
        }
    };
    init_tracing(&initial.logging);

    // Setup a server
    let opt = Opt::parse_args();
    let mut server = Server::new(Some(opt)).expect("server init");
    if let Some(server_config) = Arc::get_mut(&mut server.configuration) {
        server_config.grace_period_seconds = Some(initial.server.shutdown_grace_secs);
        server_config.graceful_shutdown_timeout_seconds = Some(initial.server.shutdown_grace_secs);
    }
    server.bootstrap();

    let store = Arc::new(ConfigStore::new(initial.clone()));
    let registry = match Registry::build(&initial, None) {
        Ok(registry) => Arc::new(RegistryHandle::new(Arc::new(registry))),
        Err(detail) => {
            eprintln!("relay: {}", detail);
            process::exit(1);
        }
    };

    // the watcher republishes the config; the registry rebuild runs as a
    // reload callback before the store swap so new requests see both
    let watcher = ConfigWatcher::new(
        config_path.clone(),
        store.clone(),
        Duration::from_millis(initial.server.watch_debounce_ms),
    );
    {
        let registry = registry.clone();
        watcher.on_reload(Arc::new(move |config| registry.rebuild(config.as_ref())));
    }
    server.add_service(background_service("config watcher", watcher));
    server.add_service(background_service(
        "breaker reaper",
        BreakerReaper::new(registry.clone()),
    ));

    let router = ProxyRouter::new(store.clone(), registry.clone());
    let mut proxy_service = http_proxy_service(&server.configuration, router);
    proxy_service.add_tcp(&initial.server.bind);
    server.add_service(proxy_service);

    info!("relay gateway is listening on {}", initial.server.bind);
    // run the server forever.
    server.run_forever();
}
