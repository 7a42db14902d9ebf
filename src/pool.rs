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
use std::time::{Duration, Instant};

use chrono::Utc;
use http::HeaderMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{CredentialConfig, ProviderConfig};
use crate::limiter::Accountant;
use crate::secret;
use crate::strategy::{self, Strategy};

/// Fallback retry hint when no credential knows its next reset.
const DEFAULT_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    #[error("provider has no credentials configured")]
    NoCredentialsConfigured,
    #[error("all credentials are exhausted")]
    AllExhausted,
    #[error("credential {0} is not in the pool")]
    CredentialNotFound(String),
}

// mutable slice of a live credential, always updated as a whole
#[derive(Debug)]
struct CredState {
    cooldown_until: Option<Instant>,
    healthy: bool,
    last_error: Option<String>,
    last_error_at: Option<Instant>,
}

impl Default for CredState {
    fn default() -> Self {
        CredState {
            cooldown_until: None,
            healthy: true,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// One live credential: definition, accountant and health state.
pub struct Credential {
    config: CredentialConfig,
    id: String,
    accountant: Accountant,
    state: Mutex<CredState>,
}

impl Credential {
    pub fn new(config: CredentialConfig) -> Self {
        let id = secret::fingerprint(&config.secret);
        let accountant = Accountant::new(id.clone(), &config);
        Credential {
            config,
            id,
            accountant,
            state: Mutex::new(CredState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.config.secret
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    /// Healthy, not cooling down, and holding capacity in both buckets.
    pub fn available(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.healthy || in_cooldown(&state) {
                return false;
            }
        }
        self.accountant.admissible(Utc::now())
    }

    /// Admission that charges the request window on success.
    ///
    /// A cooldown is authoritative: it refuses even when the accountant
    /// would admit.
    pub fn try_admit(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.healthy || in_cooldown(&state) {
                return false;
            }
        }
        self.accountant.try_admit(Utc::now())
    }

    /// Headroom in [0, 1], zero while unhealthy or cooling down.
    pub fn capacity_score(&self) -> f64 {
        {
            let state = self.state.lock();
            if !state.healthy || in_cooldown(&state) {
                return 0.0;
            }
        }
        self.accountant.capacity(Utc::now())
    }

    pub fn mark_exhausted(&self, retry_after: Duration) {
        let mut state = self.state.lock();
        state.cooldown_until = Some(Instant::now() + retry_after);
    }

    pub fn mark_unhealthy(&self, error: &str) {
        let mut state = self.state.lock();
        state.healthy = false;
        state.last_error = Some(error.to_string());
        state.last_error_at = Some(Instant::now());
    }

    pub fn mark_healthy(&self) {
        let mut state = self.state.lock();
        state.healthy = true;
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn absorb_headers(&self, headers: &HeaderMap) {
        self.accountant.absorb(headers);
    }

    // time until this credential could take traffic again
    fn next_reset(&self) -> Option<Duration> {
        let state = self.state.lock();
        let cooldown = state
            .cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()));
        drop(state);
        let now = Utc::now();
        let learned = self
            .accountant
            .next_reset(now)
            .and_then(|reset| (reset - now).to_std().ok());
        match (cooldown, learned) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn in_cooldown(state: &CredState) -> bool {
    matches!(state.cooldown_until, Some(until) if until > Instant::now())
}

/// What the pipeline gets back from a pool.
pub struct Selection {
    pub id: String,
    pub secret: String,
    pub credential: Arc<Credential>,
}

/// Per-provider credential pool.
///
/// Owns the live credential states and routes every selection through the
/// configured strategy. Lower priority tiers are exhausted before higher
/// ones are considered.
pub struct CredentialPool {
    provider: String,
    strategy: Box<dyn Strategy>,
    credentials: Vec<Arc<Credential>>,
}

impl CredentialPool {
    /// Builds the pool, carrying over live state from `previous` for every
    /// credential whose definition is unchanged.
    pub fn build(provider: &ProviderConfig, previous: Option<&CredentialPool>) -> Self {
        // strategy names are validated with the config, keep the build total
        let strategy = strategy::build(&provider.pool.strategy)
            .unwrap_or_else(|| Box::new(strategy::LeastLoaded));
        let credentials = provider
            .credentials
            .iter()
            .map(|config| {
                let id = secret::fingerprint(&config.secret);
                previous
                    .and_then(|pool| {
                        pool.credentials
                            .iter()
                            .find(|c| c.id() == id && c.config() == config)
                            .cloned()
                    })
                    .unwrap_or_else(|| Arc::new(Credential::new(config.clone())))
            })
            .collect();
        CredentialPool {
            provider: provider.name.clone(),
            strategy,
            credentials,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn credentials(&self) -> &[Arc<Credential>] {
        &self.credentials
    }

    /// Picks a credential with live capacity.
    ///
    /// Snapshots the pool, then lets the strategy nominate candidates until
    /// one passes admission; every refused candidate is dropped from the
    /// local snapshot so a selection never spins.
    pub fn get(&self) -> Result<Selection, PoolError> {
        if self.credentials.is_empty() {
            return Err(PoolError::NoCredentialsConfigured);
        }
        let mut tiers: Vec<u8> = self.credentials.iter().map(|c| c.priority()).collect();
        tiers.sort_unstable();
        tiers.dedup();
        for tier in tiers {
            let mut snapshot: Vec<Arc<Credential>> = self
                .credentials
                .iter()
                .filter(|c| c.priority() == tier)
                .cloned()
                .collect();
            for _ in 0..snapshot.len() {
                match self.strategy.select(&snapshot) {
                    Some(i) => {
                        let credential = snapshot[i].clone();
                        if credential.try_admit() {
                            return Ok(Selection {
                                id: credential.id().to_string(),
                                secret: credential.secret().to_string(),
                                credential,
                            });
                        }
                        snapshot.remove(i);
                    }
                    None => break,
                }
            }
        }
        Err(PoolError::AllExhausted)
    }

    /// Puts a credential on cooldown after an upstream rate-limit response.
    pub fn mark_exhausted(&self, id: &str, retry_after: Duration) -> Result<(), PoolError> {
        match self.credentials.iter().find(|c| c.id() == id) {
            Some(credential) => {
                credential.mark_exhausted(retry_after);
                Ok(())
            }
            None => Err(PoolError::CredentialNotFound(id.to_string())),
        }
    }

    /// Earliest instant any credential expects capacity back, as a delay.
    ///
    /// Never below one second so a retry-after hint stays meaningful.
    pub fn earliest_reset(&self) -> Duration {
        self.credentials
            .iter()
            .filter_map(|c| c.next_reset())
            .min()
            .unwrap_or(DEFAULT_RESET)
            .max(Duration::from_secs(1))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn credential(secret: &str, weight: u32, available: bool) -> Arc<Credential> {
        let config = CredentialConfig {
            secret: secret.to_string(),
            requests_per_minute: None,
            input_tokens_per_minute: None,
            output_tokens_per_minute: None,
            priority: 0,
            weight,
        };
        let credential = Arc::new(Credential::new(config));
        if !available {
            credential.mark_exhausted(Duration::from_secs(3_600));
        }
        credential
    }
}
