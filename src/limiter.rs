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

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use parking_lot::Mutex;
use pingora_limits::rate::Rate;

use crate::config::CredentialConfig;

// upstream rate-limit header family, anthropic wire spelling
const H_REQUESTS_LIMIT: &str = "anthropic-ratelimit-requests-limit";
const H_REQUESTS_REMAINING: &str = "anthropic-ratelimit-requests-remaining";
const H_REQUESTS_RESET: &str = "anthropic-ratelimit-requests-reset";
const H_INPUT_TOKENS_LIMIT: &str = "anthropic-ratelimit-input-tokens-limit";
const H_INPUT_TOKENS_REMAINING: &str = "anthropic-ratelimit-input-tokens-remaining";
const H_INPUT_TOKENS_RESET: &str = "anthropic-ratelimit-input-tokens-reset";
const H_OUTPUT_TOKENS_LIMIT: &str = "anthropic-ratelimit-output-tokens-limit";
const H_OUTPUT_TOKENS_REMAINING: &str = "anthropic-ratelimit-output-tokens-remaining";
const H_OUTPUT_TOKENS_RESET: &str = "anthropic-ratelimit-output-tokens-reset";

const WINDOW: Duration = Duration::from_secs(60);

// limits last observed from upstream response headers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Learned {
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub requests_reset: Option<DateTime<Utc>>,
    pub input_tokens_limit: Option<u64>,
    pub input_tokens_remaining: Option<u64>,
    pub input_tokens_reset: Option<DateTime<Utc>>,
    pub output_tokens_limit: Option<u64>,
    pub output_tokens_remaining: Option<u64>,
    pub output_tokens_reset: Option<DateTime<Utc>>,
}

/// Per-credential rate-limit accountant.
///
/// Tracks two logical buckets over a one-minute window, requests and token
/// throughput, combining the locally observed request rate with whatever the
/// upstream last reported about this credential. Admission is non-blocking:
/// a credential either admits another request right now or is skipped.
pub struct Accountant {
    key: String,
    rpm_limit: Option<u64>,
    tpm_limit: Option<u64>,
    window: Rate,
    learned: Mutex<Learned>,
}

impl Accountant {
    pub fn new(key: String, config: &CredentialConfig) -> Self {
        Accountant {
            key,
            rpm_limit: config.requests_per_minute,
            tpm_limit: combined(
                config.input_tokens_per_minute,
                config.output_tokens_per_minute,
            ),
            window: Rate::new(WINDOW),
            learned: Mutex::new(Learned::default()),
        }
    }

    /// Folds an upstream header set into the learned state.
    ///
    /// Non-numeric and negative values are ignored, resets parse as RFC 3339,
    /// absent headers leave the previous observation untouched. Applying the
    /// same header set twice lands on the same state.
    pub fn absorb(&self, headers: &HeaderMap) {
        let mut learned = self.learned.lock();
        fold_u64(headers, H_REQUESTS_LIMIT, &mut learned.requests_limit);
        fold_u64(headers, H_REQUESTS_REMAINING, &mut learned.requests_remaining);
        fold_reset(headers, H_REQUESTS_RESET, &mut learned.requests_reset);
        fold_u64(headers, H_INPUT_TOKENS_LIMIT, &mut learned.input_tokens_limit);
        fold_u64(
            headers,
            H_INPUT_TOKENS_REMAINING,
            &mut learned.input_tokens_remaining,
        );
        fold_reset(headers, H_INPUT_TOKENS_RESET, &mut learned.input_tokens_reset);
        fold_u64(headers, H_OUTPUT_TOKENS_LIMIT, &mut learned.output_tokens_limit);
        fold_u64(
            headers,
            H_OUTPUT_TOKENS_REMAINING,
            &mut learned.output_tokens_remaining,
        );
        fold_reset(
            headers,
            H_OUTPUT_TOKENS_RESET,
            &mut learned.output_tokens_reset,
        );
    }

    /// Whether both buckets would admit one more unit right now.
    pub fn admissible(&self, now: DateTime<Utc>) -> bool {
        let learned = self.learned.lock();
        // requests bucket, upstream view
        if learned.requests_remaining == Some(0) && !reset_passed(learned.requests_reset, now) {
            return false;
        }
        // requests bucket, local window against the configured cap
        if let Some(limit) = self.rpm_limit {
            let seen = self.window.observe(&self.key, 0);
            if seen >= 0 && seen as u64 >= limit {
                return false;
            }
        }
        // token bucket, upstream view of input and output combined
        let token_remaining = combined(
            learned.input_tokens_remaining,
            learned.output_tokens_remaining,
        );
        if token_remaining == Some(0) {
            let reset = earliest(learned.input_tokens_reset, learned.output_tokens_reset);
            if !reset_passed(reset, now) {
                return false;
            }
        }
        true
    }

    /// Admission test that counts the admitted request against the window.
    pub fn try_admit(&self, now: DateTime<Utc>) -> bool {
        if !self.admissible(now) {
            return false;
        }
        self.window.observe(&self.key, 1);
        true
    }

    /// Normalized headroom estimate in [0, 1].
    ///
    /// Mean of the request and combined-token ratios; a bucket with no known
    /// limit contributes 1.0.
    pub fn capacity(&self, now: DateTime<Utc>) -> f64 {
        let learned = self.learned.lock();
        (self.request_ratio(&learned, now) + self.token_ratio(&learned, now)) / 2.0
    }

    /// Earliest learned reset still in the future.
    pub fn next_reset(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let learned = self.learned.lock();
        [
            learned.requests_reset,
            learned.input_tokens_reset,
            learned.output_tokens_reset,
        ]
        .into_iter()
        .flatten()
        .filter(|reset| *reset > now)
        .min()
    }

    pub fn learned(&self) -> Learned {
        self.learned.lock().clone()
    }

    fn request_ratio(&self, learned: &Learned, now: DateTime<Utc>) -> f64 {
        if let Some(remaining) = learned.requests_remaining {
            if reset_passed(learned.requests_reset, now) {
                return 1.0;
            }
            // upstream limit when reported, the configured cap otherwise
            if let Some(limit) = learned.requests_limit.or(self.rpm_limit).filter(|l| *l > 0) {
                return clamp_ratio(remaining as f64 / limit as f64);
            }
        }
        if let Some(limit) = self.rpm_limit.filter(|l| *l > 0) {
            let seen = self.window.observe(&self.key, 0).max(0) as u64;
            return clamp_ratio((limit.saturating_sub(seen)) as f64 / limit as f64);
        }
        1.0
    }

    fn token_ratio(&self, learned: &Learned, now: DateTime<Utc>) -> f64 {
        let limit = combined(learned.input_tokens_limit, learned.output_tokens_limit)
            .or(self.tpm_limit);
        let remaining = combined(
            learned.input_tokens_remaining,
            learned.output_tokens_remaining,
        );
        match (limit, remaining) {
            (Some(limit), Some(remaining)) if limit > 0 => {
                let reset = earliest(learned.input_tokens_reset, learned.output_tokens_reset);
                if reset_passed(reset, now) {
                    1.0
                } else {
                    clamp_ratio(remaining as f64 / limit as f64)
                }
            }
            _ => 1.0,
        }
    }
}

fn combined(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn reset_passed(reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(reset, Some(reset) if reset <= now)
}

fn clamp_ratio(ratio: f64) -> f64 {
    ratio.clamp(0.0, 1.0)
}

fn fold_u64(headers: &HeaderMap, name: &str, slot: &mut Option<u64>) {
    if let Some(value) = header_str(headers, name) {
        // i64 first so negative values are seen and dropped, not wrapped
        if let Ok(parsed) = value.trim().parse::<i64>() {
            if parsed >= 0 {
                *slot = Some(parsed as u64);
            }
        }
    }
}

fn fold_reset(headers: &HeaderMap, name: &str, slot: &mut Option<DateTime<Utc>>) {
    if let Some(value) = header_str(headers, name) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) {
            *slot = Some(parsed.with_timezone(&Utc));
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses an upstream `retry-after` header, seconds only.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn credential() -> CredentialConfig {
        CredentialConfig {
            secret: "sk-test".to_string(),
            requests_per_minute: None,
            input_tokens_per_minute: None,
            output_tokens_per_minute: None,
            priority: 0,
            weight: 1,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn absorb_is_idempotent() {
        let accountant = Accountant::new("k1".to_string(), &credential());
        let set = headers(&[
            (H_REQUESTS_LIMIT, "100"),
            (H_REQUESTS_REMAINING, "40"),
            (H_REQUESTS_RESET, "2030-01-01T00:00:00Z"),
            (H_INPUT_TOKENS_LIMIT, "1000"),
            (H_INPUT_TOKENS_REMAINING, "500"),
        ]);
        accountant.absorb(&set);
        let first = accountant.learned();
        accountant.absorb(&set);
        assert_eq!(first, accountant.learned());
        assert_eq!(first.requests_remaining, Some(40));
    }

    #[test]
    fn junk_values_are_ignored_and_absent_headers_keep_state() {
        let accountant = Accountant::new("k2".to_string(), &credential());
        accountant.absorb(&headers(&[
            (H_REQUESTS_LIMIT, "100"),
            (H_REQUESTS_REMAINING, "40"),
        ]));
        accountant.absorb(&headers(&[
            (H_REQUESTS_LIMIT, "banana"),
            (H_REQUESTS_REMAINING, "-3"),
            (H_REQUESTS_RESET, "not-a-date"),
        ]));
        let learned = accountant.learned();
        assert_eq!(learned.requests_limit, Some(100));
        assert_eq!(learned.requests_remaining, Some(40));
        assert_eq!(learned.requests_reset, None);
    }

    #[test]
    fn zero_remaining_blocks_until_reset_passes() {
        let accountant = Accountant::new("k3".to_string(), &credential());
        accountant.absorb(&headers(&[
            (H_REQUESTS_REMAINING, "0"),
            (H_REQUESTS_RESET, "2030-01-01T00:00:00Z"),
        ]));
        let before = "2029-12-31T23:59:00Z".parse::<DateTime<Utc>>().unwrap();
        let after = "2030-01-01T00:01:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!accountant.admissible(before));
        assert!(accountant.admissible(after));
    }

    #[test]
    fn local_window_enforces_the_configured_cap() {
        let mut config = credential();
        config.requests_per_minute = Some(2);
        let accountant = Accountant::new("k4".to_string(), &config);
        let now = Utc::now();
        assert!(accountant.try_admit(now));
        assert!(accountant.try_admit(now));
        assert!(!accountant.try_admit(now));
    }

    #[test]
    fn capacity_blends_request_and_token_headroom() {
        let accountant = Accountant::new("k5".to_string(), &credential());
        // nothing known: full headroom
        assert_eq!(accountant.capacity(Utc::now()), 1.0);
        accountant.absorb(&headers(&[
            (H_REQUESTS_LIMIT, "100"),
            (H_REQUESTS_REMAINING, "50"),
            (H_REQUESTS_RESET, "2030-01-01T00:00:00Z"),
        ]));
        let now = "2029-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        // request ratio 0.5, token ratio defaults to 1.0
        assert!((accountant.capacity(now) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn zero_token_remaining_blocks_admission() {
        let accountant = Accountant::new("k6".to_string(), &credential());
        accountant.absorb(&headers(&[
            (H_INPUT_TOKENS_REMAINING, "0"),
            (H_OUTPUT_TOKENS_REMAINING, "0"),
            (H_OUTPUT_TOKENS_RESET, "2030-01-01T00:00:00Z"),
        ]));
        let now = "2029-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!accountant.admissible(now));
    }

    #[test]
    fn next_reset_picks_the_earliest_future_instant() {
        let accountant = Accountant::new("k7".to_string(), &credential());
        accountant.absorb(&headers(&[
            (H_REQUESTS_RESET, "2030-01-01T00:02:00Z"),
            (H_INPUT_TOKENS_RESET, "2030-01-01T00:01:00Z"),
        ]));
        let now = "2030-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            accountant.next_reset(now),
            Some("2030-01-01T00:01:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "17")])),
            Some(Duration::from_secs(17))
        );
        assert_eq!(parse_retry_after(&headers(&[("retry-after", "soon")])), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
