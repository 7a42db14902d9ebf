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
use std::str::FromStr;

use pingora::http::ResponseHeader;
use pingora::proxy::Session;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

// the upstream-compatible error envelope, clients parse this strictly
#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

/// Maps a proxy-originated status to the envelope error type.
pub fn error_kind(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        503 => "overloaded_error",
        _ => "api_error",
    }
}

pub struct ResponseProvider {}

impl ResponseProvider {
    pub fn new() -> Self {
        ResponseProvider {}
    }

    /// Writes an envelope-shaped error response and closes the exchange.
    pub async fn error_response(
        &self,
        session: &mut Session,
        status: u16,
        message: &str,
        headers: Option<HashMap<&str, String>>,
    ) -> pingora::Result<()> {
        let status_code =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut res_header = ResponseHeader::build(status_code, None)?;
        if let Some(headers) = headers {
            for (key, value) in headers.iter() {
                let name = HeaderName::from_str(key)
                    .map_err(|_| pingora::Error::explain(pingora::ErrorType::InternalError, "bad header name"))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| pingora::Error::explain(pingora::ErrorType::InternalError, "bad header value"))?;
                res_header.insert_header(name, value)?;
            }
        }
        res_header.insert_header("Content-Type", "application/json")?;
        let envelope = ErrorEnvelope {
            kind: "error",
            error: ErrorDetail {
                kind: error_kind(status),
                message,
            },
        };
        let json_body = serde_json::to_string(&envelope)
            .map_err(|_| pingora::Error::explain(pingora::ErrorType::InternalError, "body serialization"))?;
        let body_bytes = Some(Bytes::from(json_body));
        session.set_keepalive(None);
        session
            .write_response_header(Box::new(res_header), false)
            .await?;
        session.write_response_body(body_bytes, true).await?;
        Ok(())
    }

    /// The unauthenticated liveness body.
    pub async fn health_response(&self, session: &mut Session) -> pingora::Result<()> {
        let mut res_header = ResponseHeader::build(StatusCode::OK, None)?;
        res_header.insert_header("Content-Type", "application/json")?;
        let json_body = serde_json::to_string(&HealthBody { status: "ok" })
            .map_err(|_| pingora::Error::explain(pingora::ErrorType::InternalError, "body serialization"))?;
        session
            .write_response_header(Box::new(res_header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::from(json_body)), true)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_to_the_upstream_shape() {
        let envelope = ErrorEnvelope {
            kind: "error",
            error: ErrorDetail {
                kind: error_kind(429),
                message: "all credentials are exhausted",
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"all credentials are exhausted"}}"#
        );
    }

    #[test]
    fn statuses_map_to_documented_error_kinds() {
        assert_eq!(error_kind(401), "authentication_error");
        assert_eq!(error_kind(404), "not_found_error");
        assert_eq!(error_kind(429), "rate_limit_error");
        assert_eq!(error_kind(502), "api_error");
        assert_eq!(error_kind(503), "overloaded_error");
        assert_eq!(error_kind(504), "api_error");
    }
}
