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

// a single upstream API credential inside a provider pool
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    /// The opaque upstream secret. Never logged; identified by fingerprint.
    pub secret: String,
    /// Requests-per-minute cap, when the operator knows it up front.
    /// Upstream-learned limits take precedence once observed.
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    /// Input-token throughput cap per minute.
    #[serde(default)]
    pub input_tokens_per_minute: Option<u64>,
    /// Output-token throughput cap per minute.
    #[serde(default)]
    pub output_tokens_per_minute: Option<u64>,
    /// Selection tier, 0 to 2. Lower tiers are exhausted first.
    #[serde(default)]
    pub priority: u8,
    /// Draw weight for the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}
