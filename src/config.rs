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

pub mod credential;
pub mod loader;
pub mod logging;
pub mod provider;
pub mod routing;
pub mod server;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use credential::CredentialConfig;
pub use loader::{load, parse, ConfigError, ConfigFormat};
pub use logging::LoggingConfig;
pub use provider::{BreakerConfig, PoolConfig, ProviderConfig, ProviderKind, PROVIDER_KINDS};
pub use routing::RoutingConfig;
pub use server::{ClientAuth, DebugConfig, ServerConfig};
pub use validate::{validate, Diagnostic, ValidationReport};

// the root configuration for the whole gateway
// immutable once published, replaced wholesale on reload
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Front-door server settings: bind address, client auth, timeouts.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream provider definitions, each with its credential pool.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Provider routing policy.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Response cache mode. Parsed for compatibility, not consulted here.
    #[serde(default)]
    pub cache: CacheMode,
    /// Log level and format knobs.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// enum cache mode
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Off,
    Memory,
}
