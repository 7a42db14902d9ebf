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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use rand::RngCore;

use crate::pool::Credential;

/// Recognized pool strategy names.
pub const STRATEGY_NAMES: &[&str] = &["least_loaded", "round_robin", "random", "weighted"];

pub fn is_known(name: &str) -> bool {
    STRATEGY_NAMES.contains(&name)
}

/// Builds a strategy by its configured name.
pub fn build(name: &str) -> Option<Box<dyn Strategy>> {
    match name {
        "least_loaded" => Some(Box::new(LeastLoaded)),
        "round_robin" => Some(Box::new(RoundRobin::new())),
        "random" => Some(Box::new(Random)),
        "weighted" => Some(Box::new(Weighted)),
        _ => None,
    }
}

/// How a pool orders its credentials.
///
/// `select` returns the index of an available credential within `candidates`,
/// or `None` when nothing in the slice can take another request.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, candidates: &[Arc<Credential>]) -> Option<usize>;
}

// picks the credential with the most headroom
pub struct LeastLoaded;

impl Strategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, candidates: &[Arc<Credential>]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, credential) in candidates.iter().enumerate() {
            if !credential.available() {
                continue;
            }
            let score = credential.capacity_score();
            // strictly-greater keeps ties on the earliest index
            match best {
                Some((_, current)) if score <= current => {}
                _ => best = Some((i, score)),
            }
        }
        best.map(|(i, _)| i)
    }
}

// walks the pool with a shared atomic cursor
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[Arc<Credential>]) -> Option<usize> {
        let n = candidates.len();
        if n == 0 {
            return None;
        }
        // exactly one advancement per selection, shared across tasks
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let i = (start + offset) % n;
            if candidates[i].available() {
                return Some(i);
            }
        }
        None
    }
}

// uniform over the available credentials
pub struct Random;

impl Strategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, candidates: &[Arc<Credential>]) -> Option<usize> {
        let available: Vec<usize> = indexes_of_available(candidates);
        if available.is_empty() {
            return None;
        }
        Some(available[uniform(available.len())])
    }
}

// draws proportionally to the configured weights
pub struct Weighted;

impl Strategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[Arc<Credential>]) -> Option<usize> {
        let available = indexes_of_available(candidates);
        let total: u64 = available
            .iter()
            .map(|&i| u64::from(candidates[i].weight()))
            .sum();
        if total == 0 {
            return None;
        }
        let mut draw = uniform_u64(total);
        for &i in &available {
            let weight = u64::from(candidates[i].weight());
            if draw < weight {
                return Some(i);
            }
            draw -= weight;
        }
        // weights sum to total, the walk always lands inside one
        available.last().copied()
    }
}

fn indexes_of_available(candidates: &[Arc<Credential>]) -> Vec<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.available())
        .map(|(i, _)| i)
        .collect()
}

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn uniform(n: usize) -> usize {
    (uniform_u64(n as u64)) as usize
}

// os-backed randomness, with a monotonic-clock draw if entropy is unavailable
fn uniform_u64(n: u64) -> u64 {
    let mut buf = [0u8; 8];
    if rand::thread_rng().try_fill_bytes(&mut buf).is_ok() {
        u64::from_le_bytes(buf) % n
    } else {
        u64::from(CLOCK_EPOCH.elapsed().subsec_nanos()) % n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::credential;

    fn pool(entries: &[(u32, bool)]) -> Vec<Arc<Credential>> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (weight, available))| credential(&format!("sk-{}", i), *weight, *available))
            .collect()
    }

    #[test]
    fn build_knows_every_published_name() {
        for name in STRATEGY_NAMES {
            let strategy = build(name).unwrap();
            assert_eq!(&strategy.name(), name);
        }
        assert!(build("mystery").is_none());
    }

    #[test]
    fn round_robin_is_fair_over_full_cycles() {
        let creds = pool(&[(1, true), (1, true), (1, true)]);
        let strategy = RoundRobin::new();
        let mut counts = [0usize; 3];
        for _ in 0..30 {
            counts[strategy.select(&creds).unwrap()] += 1;
        }
        assert_eq!(counts, [10, 10, 10]);
    }

    #[test]
    fn round_robin_skips_unavailable_positions() {
        let creds = pool(&[(1, true), (1, false), (1, true)]);
        let strategy = RoundRobin::new();
        for _ in 0..10 {
            let picked = strategy.select(&creds).unwrap();
            assert_ne!(picked, 1);
        }
    }

    #[test]
    fn least_loaded_breaks_ties_on_first_index() {
        let creds = pool(&[(1, true), (1, true)]);
        assert_eq!(LeastLoaded.select(&creds), Some(0));
    }

    #[test]
    fn weighted_only_returns_available_credentials() {
        let creds = pool(&[(100, false), (1, true)]);
        for _ in 0..20 {
            assert_eq!(Weighted.select(&creds), Some(1));
        }
    }

    #[test]
    fn every_strategy_reports_exhaustion_on_an_empty_or_cooled_pool() {
        let cooled = pool(&[(1, false), (2, false)]);
        let empty: Vec<Arc<Credential>> = Vec::new();
        for name in STRATEGY_NAMES {
            let strategy = build(name).unwrap();
            assert_eq!(strategy.select(&cooled), None, "strategy {}", name);
            assert_eq!(strategy.select(&empty), None, "strategy {}", name);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // a selection is always an index of an available candidate,
            // or nothing at all
            #[test]
            fn selection_stays_inside_the_list(
                entries in proptest::collection::vec((1u32..10, any::<bool>()), 0..8),
                which in 0usize..4,
            ) {
                let creds = pool(&entries);
                let strategy = build(STRATEGY_NAMES[which]).unwrap();
                match strategy.select(&creds) {
                    Some(i) => {
                        prop_assert!(i < creds.len());
                        prop_assert!(creds[i].available());
                    }
                    None => {
                        prop_assert!(creds.iter().all(|c| !c.available()));
                    }
                }
            }
        }
    }
}
