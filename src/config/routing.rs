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

/// Recognized routing strategy names.
pub const ROUTING_STRATEGIES: &[&str] = &["single", "failover"];

// provider routing policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// `single` pins traffic to the primary provider, `failover` walks the
    /// remaining eligible providers when the primary cannot take a request.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Primary provider name. Defaults to the first enabled provider.
    #[serde(default)]
    pub provider: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            strategy: default_strategy(),
            provider: None,
        }
    }
}

impl RoutingConfig {
    pub fn is_failover(&self) -> bool {
        self.strategy == "failover"
    }
}

fn default_strategy() -> String {
    "single".to_string()
}
