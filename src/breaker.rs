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

use async_trait::async_trait;
use parking_lot::Mutex;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;

use crate::config::BreakerConfig;
use crate::events;
use crate::provider::RegistryHandle;

// enum circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    open_until: Option<Instant>,
    open_streak: u32,
    probes_issued: u32,
    probe_successes: u32,
}

/// Per-provider circuit breaker.
///
/// Counts consecutive failures inside a sliding window; trips open once the
/// threshold is hit, then lets a bounded number of probes through after the
/// open interval. Transitions are serialized behind one mutex so an observer
/// that recorded a failure reads at least its own transition.
///
/// Rate-limit responses never reach this type; they act on the credential
/// pool instead.
pub struct Breaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(provider: String, config: BreakerConfig) -> Self {
        Breaker {
            provider,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_start: None,
                open_until: None,
                open_streak: 0,
                probes_issued: 0,
                probe_successes: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the provider may take this request.
    ///
    /// Closed always admits. Open admits nothing until `open_until`, at
    /// which point the breaker goes half-open and the caller receives the
    /// first probe token. Half-open admits while probe tokens remain.
    pub fn is_eligible(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if open_elapsed(&inner) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probes_issued = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_issued < self.config.probe_budget {
                    inner.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Non-consuming routing check: everything except a still-closed open
    /// interval may appear in a route order.
    pub fn allows_routing(&self) -> bool {
        let inner = self.inner.lock();
        inner.state != CircuitState::Open || open_elapsed(&inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.window_start = None;
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probe_successes {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.window_start = None;
                    inner.open_until = None;
                    inner.open_streak = 0;
                    inner.probes_issued = 0;
                    inner.probe_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a connection error, 5xx or timeout.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                let window = Duration::from_secs(self.config.window_secs);
                match inner.window_start {
                    Some(start) if now.duration_since(start) <= window => {}
                    _ => {
                        inner.window_start = Some(now);
                        inner.consecutive_failures = 0;
                    }
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                // a failed probe reopens immediately, with backoff
                self.trip(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Drives the timed open-to-half-open transition without traffic.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && open_elapsed(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
            inner.probes_issued = 0;
            inner.probe_successes = 0;
        }
    }

    /// Remaining open interval, for diagnostics and tests.
    pub fn open_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .open_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.open_streak += 1;
        let base = self.config.open_secs;
        let factor = 1u64 << (inner.open_streak - 1).min(16);
        let hold = base.saturating_mul(factor).min(self.config.max_open_secs);
        inner.open_until = Some(now + Duration::from_secs(hold));
        inner.probes_issued = 0;
        inner.probe_successes = 0;
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state != next {
            events::breaker(&self.provider, inner.state.as_str(), next.as_str());
            inner.state = next;
        }
    }
}

fn open_elapsed(inner: &Inner) -> bool {
    matches!(inner.open_until, Some(until) if Instant::now() >= until)
}

/// Background loop that drives timed breaker transitions.
///
/// Without it an open breaker would only go half-open once traffic happens
/// to ask for the provider.
pub struct BreakerReaper {
    registry: Arc<RegistryHandle>,
    interval: Duration,
}

impl BreakerReaper {
    pub fn new(registry: Arc<RegistryHandle>) -> Self {
        BreakerReaper {
            registry,
            interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl BackgroundService for BreakerReaper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for provider in self.registry.get().providers() {
                        provider.breaker.tick();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(open_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window_secs: 60,
            open_secs,
            max_open_secs: 300,
            probe_budget: 2,
            probe_successes: 2,
        }
    }

    fn breaker(open_secs: u64) -> Breaker {
        Breaker::new("p1".to_string(), config(open_secs))
    }

    #[test]
    fn trips_open_at_the_failure_threshold() {
        let breaker = breaker(30);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_eligible());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_eligible());
        assert!(!breaker.allows_routing());
    }

    #[test]
    fn a_success_resets_the_consecutive_count() {
        let breaker = breaker(30);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_becomes_half_open_and_rations_probes() {
        let breaker = breaker(0);
        for _ in 0..3 {
            breaker.record_failure();
        }
        // the zero-second hold has already elapsed
        assert!(breaker.is_eligible());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // one probe token left out of the budget of two
        assert!(breaker.is_eligible());
        assert!(!breaker.is_eligible());
    }

    #[test]
    fn enough_probe_successes_close_the_breaker() {
        let breaker = breaker(0);
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_eligible());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn a_probe_failure_reopens_with_backoff() {
        let breaker = breaker(1);
        for _ in 0..3 {
            breaker.record_failure();
        }
        // force the timed transition as the reaper would
        std::thread::sleep(Duration::from_millis(1_050));
        breaker.tick();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        // second open interval is doubled
        let remaining = breaker.open_remaining().unwrap();
        assert!(remaining > Duration::from_secs(1));
    }

    #[test]
    fn tick_is_a_no_op_while_the_hold_lasts() {
        let breaker = breaker(30);
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.tick();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
