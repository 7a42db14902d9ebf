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

use pingora::proxy::Session;

use crate::config::server::ClientAuth;
use crate::response::ResponseProvider;

/// What the admission check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed; the client auth headers are dropped upstream.
    Allowed,
    /// Request may proceed and its bearer token travels to the upstream
    /// unchanged.
    AllowedPassthrough,
    /// A 401 response was written, stop here.
    Denied,
}

pub struct AuthProvider {
    response_provider: ResponseProvider,
}

impl AuthProvider {
    pub fn new() -> Self {
        AuthProvider {
            response_provider: ResponseProvider::new(),
        }
    }

    /// Enforces the configured client auth mode.
    pub async fn admit(
        &self,
        mode: Option<&ClientAuth>,
        session: &mut Session,
    ) -> pingora::Result<Admission> {
        match mode {
            Some(ClientAuth::Anonymous { anonymous: true }) => Ok(Admission::Allowed),
            Some(ClientAuth::ApiKey { api_key }) => {
                let presented = header_bytes(session, "x-api-key");
                if matches(presented, api_key.secret.as_bytes()) {
                    Ok(Admission::Allowed)
                } else {
                    self.deny(session, "invalid x-api-key").await
                }
            }
            Some(ClientAuth::Bearer { bearer }) => {
                let presented = bearer_token(session);
                if matches(presented, bearer.token.as_bytes()) {
                    Ok(Admission::Allowed)
                } else {
                    self.deny(session, "invalid bearer token").await
                }
            }
            Some(ClientAuth::Passthrough { passthrough }) => {
                // opt-in subscription tokens: check the shape, forward as-is
                match bearer_token(session) {
                    Some(token) if token.starts_with(passthrough.prefix.as_bytes()) => {
                        Ok(Admission::AllowedPassthrough)
                    }
                    _ => self.deny(session, "bearer token of the expected shape required").await,
                }
            }
            // anonymous access is opt-in only
            _ => self.deny(session, "authentication required").await,
        }
    }

    async fn deny(&self, session: &mut Session, message: &str) -> pingora::Result<Admission> {
        self.response_provider
            .error_response(session, 401, message, None)
            .await?;
        Ok(Admission::Denied)
    }
}

fn header_bytes<'a>(session: &'a Session, name: &str) -> Option<&'a [u8]> {
    session
        .req_header()
        .headers
        .get(name)
        .map(|v| v.as_bytes())
}

fn bearer_token(session: &Session) -> Option<&[u8]> {
    let value = header_bytes(session, "authorization")?;
    value.strip_prefix(b"Bearer ")
}

fn matches(presented: Option<&[u8]>, expected: &[u8]) -> bool {
    match presented {
        Some(presented) => constant_time_eq(presented, expected),
        None => false,
    }
}

// byte-wise compare that does not short-circuit on the first mismatch
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_agrees_with_equality() {
        assert!(constant_time_eq(b"proxy-key", b"proxy-key"));
        assert!(!constant_time_eq(b"proxy-key", b"proxy-kee"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn missing_header_never_matches() {
        assert!(!matches(None, b"proxy-key"));
    }
}
