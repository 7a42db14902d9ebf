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

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Short stable fingerprint of a credential secret.
///
/// Used as the credential identity in logs and pool lookups.
/// Deterministic and truncated, never used for authentication.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut id = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint("sk-test-1"), fingerprint("sk-test-1"));
        assert_ne!(fingerprint("sk-test-1"), fingerprint("sk-test-2"));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let id = fingerprint("anything");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
