/*
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

//! Structured event emission.
//!
//! The field set is the contract; levels are advisory and a sink may render
//! the events however it likes.

use tracing::{info, warn};

// a credential was chosen for a request
pub fn select(provider: &str, credential_id: &str, strategy: &str, decision: &str) {
    info!(
        event = "select",
        provider, credential_id, strategy, decision
    );
}

// a forward finished, successfully or not
pub fn forward(
    provider: &str,
    credential_id: &str,
    outcome: &str,
    status_code: u16,
    latency_ms: u128,
) {
    info!(
        event = "forward",
        provider, credential_id, outcome, status_code, latency_ms
    );
}

// a credential or a whole pool ran out of capacity
pub fn exhausted(provider: &str, credential_id: &str, retry_after_ms: u128) {
    warn!(event = "exhaust", provider, credential_id, retry_after_ms);
}

// a config reload attempt finished
pub fn reload(reload_ok: bool, detail: &str) {
    if reload_ok {
        info!(event = "reload", reload_ok, detail);
    } else {
        warn!(event = "reload", reload_ok, detail);
    }
}

// a circuit breaker changed state
pub fn breaker(provider: &str, from: &str, breaker_state: &str) {
    warn!(event = "trip", provider, from, breaker_state);
}
