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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::credential::CredentialConfig;

// an upstream provider definition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Unique provider name, referenced by the routing policy.
    pub name: String,
    /// Provider dialect name. Non-Anthropic kinds are thin URL and auth
    /// rewrites; an unrecognized name is a validation diagnostic, not a
    /// parse failure, so it never hides other defects.
    #[serde(alias = "type")]
    pub kind: String,
    /// Wire endpoint override. Each kind carries a sensible default.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Disabled providers keep their config but never receive traffic.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Model alias to canonical-name mapping.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    /// The credential pool backing this provider.
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    /// Pooling policy.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Circuit breaker tuning.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Cloud region, required by the bedrock and vertex kinds.
    #[serde(default)]
    pub region: Option<String>,
    /// Cloud project id, required by the vertex kind.
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ProviderConfig {
    /// The parsed kind, when the configured name is recognized.
    pub fn parsed_kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_name(&self.kind)
    }
}

/// Recognized provider kind names.
pub const PROVIDER_KINDS: &[&str] = &["anthropic", "zai", "ollama", "bedrock", "vertex"];

// enum provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    Zai,
    Ollama,
    Bedrock,
    Vertex,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(ProviderKind::Anthropic),
            "zai" => Some(ProviderKind::Zai),
            "ollama" => Some(ProviderKind::Ollama),
            "bedrock" => Some(ProviderKind::Bedrock),
            "vertex" => Some(ProviderKind::Vertex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Zai => "zai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Vertex => "vertex",
        }
    }
}

// credential pooling policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Selection strategy name.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            strategy: default_strategy(),
            enabled: true,
        }
    }
}

// circuit breaker tuning, per provider
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures inside the window that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failure counting window, seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How long the breaker stays open before probing, seconds.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    /// Open interval ceiling once backoff kicks in, seconds.
    #[serde(default = "default_max_open_secs")]
    pub max_open_secs: u64,
    /// Probe requests admitted while half-open.
    #[serde(default = "default_probe_budget")]
    pub probe_budget: u32,
    /// Consecutive probe successes needed to close again.
    #[serde(default = "default_probe_successes")]
    pub probe_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            open_secs: default_open_secs(),
            max_open_secs: default_max_open_secs(),
            probe_budget: default_probe_budget(),
            probe_successes: default_probe_successes(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_strategy() -> String {
    "least_loaded".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    30
}

fn default_open_secs() -> u64 {
    30
}

fn default_max_open_secs() -> u64 {
    300
}

fn default_probe_budget() -> u32 {
    3
}

fn default_probe_successes() -> u32 {
    2
}
