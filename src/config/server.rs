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

use serde::{Deserialize, Serialize};

// front-door server configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Client-facing authentication. Requests are rejected with 401 unless
    /// a mode is configured; anonymous access must be opted into explicitly.
    #[serde(default)]
    pub auth: Option<ClientAuth>,
    /// Paths forwarded to the upstream. Anything else is answered 404.
    #[serde(default = "default_paths")]
    pub paths: Vec<String>,
    /// Upstream connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle-read timeout per upstream read, milliseconds. Streaming bodies
    /// have no overall deadline, so this also bounds inter-event gaps and
    /// must stay comfortably above them.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Graceful shutdown budget in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Config watcher debounce window in milliseconds.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    /// Redacted request/response snapshots for troubleshooting.
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            auth: None,
            paths: default_paths(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            watch_debounce_ms: default_watch_debounce_ms(),
            debug: DebugConfig::default(),
        }
    }
}

// enum client auth mode
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClientAuth {
    ApiKey { api_key: ApiKeyAuth },
    Bearer { bearer: BearerAuth },
    Passthrough { passthrough: PassthroughAuth },
    Anonymous { anonymous: bool },
}

// shared-secret auth over the x-api-key header
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiKeyAuth {
    pub secret: String,
}

// opaque bearer-token auth over the authorization header
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BearerAuth {
    pub token: String,
}

// subscription passthrough: accept a bearer token of the configured shape
// and forward it to the upstream unchanged
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PassthroughAuth {
    pub prefix: String,
}

// debug snapshot knobs, hooks never mutate the streams
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Byte cap on the captured request body snapshot.
    #[serde(default = "default_body_cap")]
    pub body_cap: usize,
    /// Response headers worth echoing into the log.
    #[serde(default)]
    pub response_headers: Vec<String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        DebugConfig {
            enabled: false,
            body_cap: default_body_cap(),
            response_headers: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:6188".to_string()
}

fn default_paths() -> Vec<String> {
    vec!["/v1/messages".to_string()]
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_watch_debounce_ms() -> u64 {
    100
}

fn default_body_cap() -> usize {
    2_048
}
