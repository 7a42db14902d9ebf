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
use std::sync::Arc;
use std::time::{Duration, Instant};

use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::HttpPeer;
use pingora::proxy::{ProxyHttp, Session};
use pingora::{Error, ErrorSource, ErrorType};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use tracing::debug;

use crate::auth::{Admission, AuthProvider};
use crate::config::ProxyConfig;
use crate::events;
use crate::limiter;
use crate::pool::Selection;
use crate::provider::{Provider, Registry, RegistryHandle};
use crate::response::ResponseProvider;
use crate::store::ConfigStore;

// request headers that never travel to the upstream
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// The front-door proxy.
///
/// One request flows admit, classify, route, select, forward; the response
/// streams back chunk for chunk while its headers feed the accountant and
/// the breaker. Response bodies are never inspected or buffered, which is
/// what keeps event streams and their tool_use ids byte-identical.
pub struct ProxyRouter {
    store: Arc<ConfigStore>,
    registry: Arc<RegistryHandle>,
    auth_provider: AuthProvider,
    response_provider: ResponseProvider,
}

impl ProxyRouter {
    pub fn new(store: Arc<ConfigStore>, registry: Arc<RegistryHandle>) -> Self {
        ProxyRouter {
            store,
            registry,
            auth_provider: AuthProvider::new(),
            response_provider: ResponseProvider::new(),
        }
    }
}

// per-request state, pinned to one config and registry snapshot
pub struct RouterCtx {
    config: Option<Arc<ProxyConfig>>,
    registry: Option<Arc<Registry>>,
    route: Vec<usize>,
    attempt: usize,
    provider: Option<Arc<Provider>>,
    selection: Option<Selection>,
    passthrough: bool,
    exhausted_seen: bool,
    retry_after: Option<Duration>,
    outcome: &'static str,
    started: Instant,
    rewrite_model: bool,
    body_buffer: Vec<u8>,
    debug_body: Vec<u8>,
    debug_body_logged: bool,
}

#[async_trait]
impl ProxyHttp for ProxyRouter {
    type CTX = RouterCtx;

    fn new_ctx(&self) -> Self::CTX {
        RouterCtx {
            config: None,
            registry: None,
            route: Vec::new(),
            attempt: 0,
            provider: None,
            selection: None,
            passthrough: false,
            exhausted_seen: false,
            retry_after: None,
            outcome: "",
            started: Instant::now(),
            rewrite_model: false,
            body_buffer: Vec::new(),
            debug_body: Vec::new(),
            debug_body_logged: false,
        }
    }

    // admit, classify and route before anything goes upstream
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> pingora::Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.clone();

        // liveness endpoint stays unauthenticated
        if method == Method::GET && path == "/health" {
            self.response_provider.health_response(session).await?;
            return Ok(true);
        }

        // pin this request to one config and registry snapshot; a reload
        // mid-stream must not tear the request apart
        let config = self.store.get();
        let registry = self.registry.get();
        ctx.config = Some(config.clone());
        ctx.registry = Some(registry.clone());

        match self
            .auth_provider
            .admit(config.server.auth.as_ref(), session)
            .await?
        {
            Admission::Denied => {
                ctx.outcome = "unauthorized";
                return Ok(true);
            }
            Admission::AllowedPassthrough => ctx.passthrough = true,
            Admission::Allowed => {}
        }

        if method != Method::POST || !config.server.paths.iter().any(|p| p == &path) {
            ctx.outcome = "not_found";
            self.response_provider
                .error_response(session, 404, "not found", None)
                .await?;
            return Ok(true);
        }

        ctx.route = registry
            .route_order(&config.routing)
            .into_iter()
            .filter(|i| registry.providers()[*i].breaker.allows_routing())
            .collect();
        if ctx.route.is_empty() {
            ctx.outcome = "unavailable";
            self.response_provider
                .error_response(session, 503, "no provider is able to take the request", None)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    // walk the route order until a provider grants a credential
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        let registry = ctx
            .registry
            .clone()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no registry snapshot"))?;
        let config = ctx
            .config
            .clone()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no config snapshot"))?;

        while ctx.attempt < ctx.route.len() {
            let provider = registry.providers()[ctx.route[ctx.attempt]].clone();
            // half-open providers hand out a bounded number of probes
            if !provider.breaker.is_eligible() {
                ctx.attempt += 1;
                continue;
            }
            match provider.pool.get() {
                Ok(selection) => {
                    events::select(
                        provider.name(),
                        &selection.id,
                        provider.pool.strategy_name(),
                        if ctx.attempt == 0 { "primary" } else { "failover" },
                    );
                    let endpoint = &provider.endpoint;
                    let mut peer = Box::new(HttpPeer::new(
                        (endpoint.host.as_str(), endpoint.port),
                        endpoint.tls,
                        endpoint.sni.clone(),
                    ));
                    peer.options.connection_timeout =
                        Some(Duration::from_millis(config.server.connect_timeout_ms));
                    peer.options.read_timeout =
                        Some(Duration::from_millis(config.server.read_timeout_ms));
                    ctx.rewrite_model = provider.has_model_aliases();
                    // a failover retry replays the body through the filter
                    ctx.body_buffer.clear();
                    ctx.provider = Some(provider);
                    ctx.selection = Some(selection);
                    return Ok(peer);
                }
                Err(_) => {
                    let retry = provider.pool.earliest_reset();
                    ctx.exhausted_seen = true;
                    ctx.retry_after = Some(match ctx.retry_after {
                        Some(existing) => existing.min(retry),
                        None => retry,
                    });
                    events::exhausted(provider.name(), "-", retry.as_millis());
                    ctx.attempt += 1;
                }
            }
        }
        if ctx.exhausted_seen {
            ctx.outcome = "exhausted";
            Err(Error::explain(
                ErrorType::HTTPStatus(429),
                "all credentials are exhausted",
            ))
        } else {
            ctx.outcome = "unavailable";
            Err(Error::explain(
                ErrorType::HTTPStatus(503),
                "no eligible provider",
            ))
        }
    }

    // rewrite the outgoing request for the chosen provider and credential
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let provider = ctx
            .provider
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no provider selected"))?;
        let selection = ctx
            .selection
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no credential selected"))?;

        for name in HOP_BY_HOP_HEADERS {
            upstream_request.remove_header(*name);
        }
        if ctx.passthrough {
            // the client token travels unchanged, only the key header goes
            upstream_request.remove_header("x-api-key");
        } else {
            upstream_request.remove_header("authorization");
            upstream_request.remove_header("x-api-key");
            provider.rewrite_auth(upstream_request, &selection.secret)?;
        }

        upstream_request.insert_header("host", provider.endpoint.host.as_str())?;
        if ctx.rewrite_model {
            // the alias rewrite may change the body length, so the upstream
            // request switches to chunked framing
            upstream_request.remove_header("content-length");
            upstream_request.insert_header("transfer-encoding", "chunked")?;
        }
        if !provider.endpoint.path_prefix.is_empty() {
            let suffix = upstream_request
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let joined = format!("{}{}", provider.endpoint.path_prefix, suffix);
            let uri = joined
                .parse::<http::Uri>()
                .map_err(|_| Error::explain(ErrorType::InternalError, "bad upstream uri"))?;
            upstream_request.set_uri(uri);
        }
        Ok(())
    }

    // model-alias resolution and the debug-mode body snapshot
    //
    // Providers without aliases stream the body through untouched; with
    // aliases configured the body is buffered and the aliased model name is
    // swapped for its canonical form before going upstream.
    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let debug_config = match &ctx.config {
            Some(config) if config.server.debug.enabled => Some(config.server.debug.clone()),
            _ => None,
        };
        // snapshot the client bytes before any rewrite
        if let (Some(debug_config), Some(chunk)) = (&debug_config, body.as_ref()) {
            if ctx.debug_body.len() < debug_config.body_cap {
                let take = (debug_config.body_cap - ctx.debug_body.len()).min(chunk.len());
                ctx.debug_body.extend_from_slice(&chunk[..take]);
            }
        }
        if ctx.rewrite_model {
            if let Some(chunk) = body.take() {
                ctx.body_buffer.extend_from_slice(&chunk);
            }
            if end_of_stream {
                if let Some(provider) = &ctx.provider {
                    let buffered = std::mem::take(&mut ctx.body_buffer);
                    *body = Some(Bytes::from(rewrite_model_alias(buffered, provider)));
                }
            }
        }
        if end_of_stream && debug_config.is_some() && !ctx.debug_body_logged {
            ctx.debug_body_logged = true;
            let snapshot = mask_credentials(&String::from_utf8_lossy(&ctx.debug_body));
            debug!(event = "request_body", bytes = ctx.debug_body.len(), body = %snapshot);
        }
        Ok(())
    }

    // feed rate-limit and health signals back; headers pass through verbatim
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let status = upstream_response.status.as_u16();
        if let (Some(provider), Some(selection)) = (&ctx.provider, &ctx.selection) {
            selection.credential.absorb_headers(&upstream_response.headers);
            match status {
                429 => {
                    let retry_after = limiter::parse_retry_after(&upstream_response.headers)
                        .unwrap_or(Duration::from_secs(60));
                    let _ = provider.pool.mark_exhausted(&selection.id, retry_after);
                    events::exhausted(provider.name(), &selection.id, retry_after.as_millis());
                    ctx.outcome = "rate_limited";
                }
                401 | 403 if !ctx.passthrough => {
                    // the upstream rejected our credential, not the client
                    selection.credential.mark_unhealthy("upstream rejected the credential");
                    ctx.outcome = "credential_rejected";
                }
                500..=599 => {
                    provider.breaker.record_failure();
                    ctx.outcome = "upstream_error";
                }
                200..=299 => {
                    selection.credential.mark_healthy();
                    provider.breaker.record_success();
                    ctx.outcome = "ok";
                }
                _ => {
                    ctx.outcome = "ok";
                }
            }
        }
        if let Some(config) = &ctx.config {
            let wanted = &config.server.debug.response_headers;
            if config.server.debug.enabled && !wanted.is_empty() {
                for name in wanted {
                    if let Some(value) = upstream_response.headers.get(name.as_str()) {
                        debug!(event = "response_header", name = %name, value = ?value);
                    }
                }
            }
        }
        Ok(())
    }

    // connection failures may fail over, nothing was committed downstream yet
    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        if let Some(provider) = &ctx.provider {
            provider.breaker.record_failure();
        }
        ctx.outcome = "connect_error";
        let failover = ctx
            .config
            .as_ref()
            .map(|c| c.routing.is_failover())
            .unwrap_or(false);
        if failover && ctx.attempt + 1 < ctx.route.len() {
            ctx.attempt += 1;
            e.set_retry(true);
        }
        e
    }

    // mid-proxy failures only retry while the response is uncommitted;
    // an event stream is not idempotent
    fn error_while_proxy(
        &self,
        _peer: &HttpPeer,
        session: &mut Session,
        mut e: Box<Error>,
        ctx: &mut Self::CTX,
        _client_reused: bool,
    ) -> Box<Error> {
        let from_upstream = matches!(e.esource(), ErrorSource::Upstream);
        if from_upstream {
            if let Some(provider) = &ctx.provider {
                provider.breaker.record_failure();
            }
        }
        ctx.outcome = "proxy_error";
        let failover = ctx
            .config
            .as_ref()
            .map(|c| c.routing.is_failover())
            .unwrap_or(false);
        if failover
            && from_upstream
            && session.response_written().is_none()
            && ctx.attempt + 1 < ctx.route.len()
        {
            ctx.attempt += 1;
            e.set_retry(true);
        }
        e
    }

    // every proxy-originated failure leaves in the upstream error envelope
    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16
    where
        Self::CTX: Send + Sync,
    {
        let code = status_for_error(e);
        if session.response_written().is_none() {
            let mut headers: Option<HashMap<&str, String>> = None;
            if code == 429 {
                let secs = ctx
                    .retry_after
                    .unwrap_or(Duration::from_secs(60))
                    .as_secs()
                    .max(1);
                headers = Some(HashMap::from([("retry-after", secs.to_string())]));
            }
            let message = message_for_status(code);
            let _ = self
                .response_provider
                .error_response(session, code, message, headers)
                .await;
        }
        code
    }

    // one completion event per request, whatever the path taken
    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        if ctx.outcome.is_empty() {
            ctx.outcome = match e {
                // a vanished client is not an upstream failure
                Some(e) if matches!(e.esource(), ErrorSource::Downstream) => "client_abort",
                Some(_) => "error",
                None => "ok",
            };
        }
        let provider = ctx.provider.as_ref().map(|p| p.name()).unwrap_or("-");
        let credential = ctx.selection.as_ref().map(|s| s.id.as_str()).unwrap_or("-");
        events::forward(
            provider,
            credential,
            ctx.outcome,
            status,
            ctx.started.elapsed().as_millis(),
        );
    }
}

fn status_for_error(e: &Error) -> u16 {
    match e.etype() {
        ErrorType::HTTPStatus(code) => *code,
        ErrorType::ConnectTimedout | ErrorType::ReadTimedout | ErrorType::WriteTimedout => 504,
        _ => match e.esource() {
            ErrorSource::Upstream => 502,
            ErrorSource::Downstream => 400,
            _ => 500,
        },
    }
}

fn message_for_status(code: u16) -> &'static str {
    match code {
        429 => "all credentials are exhausted, retry later",
        503 => "no provider is able to take the request",
        504 => "upstream timed out",
        502 => "upstream unreachable",
        400 => "malformed request",
        _ => "internal proxy error",
    }
}

// swaps a configured model alias for its canonical name
//
// Surgical splice around the model value: every other byte of the body,
// tool_use ids included, is forwarded exactly as the client sent it.
fn rewrite_model_alias(body: Vec<u8>, provider: &Provider) -> Vec<u8> {
    let text = match std::str::from_utf8(&body) {
        Ok(text) => text,
        Err(_) => return body,
    };
    let key = "\"model\"";
    let found = match text.find(key) {
        Some(found) => found,
        None => return body,
    };
    let after_key = found + key.len();
    let (start, end) = match value_span(&text[after_key..]) {
        Some(span) => span,
        None => return body,
    };
    let alias = &text[after_key + start..after_key + end];
    let canonical = provider.canonical_model(alias);
    if canonical == alias {
        return body;
    }
    let mut out = String::with_capacity(text.len() - alias.len() + canonical.len());
    out.push_str(&text[..after_key + start]);
    out.push_str(canonical);
    out.push_str(&text[after_key + end..]);
    out.into_bytes()
}

// masks values of credential-looking json fields inside a debug snapshot
fn mask_credentials(body: &str) -> String {
    const SENSITIVE: &[&str] = &["api_key", "authorization", "secret", "token", "x-api-key"];
    let mut out = body.to_string();
    for key in SENSITIVE {
        let needle = format!("\"{}\"", key);
        let mut from = 0;
        while let Some(found) = out[from..].find(&needle) {
            let after_key = from + found + needle.len();
            match value_span(&out[after_key..]) {
                Some((start, end)) => {
                    out.replace_range(after_key + start..after_key + end, "***");
                    from = after_key + start + 3;
                }
                None => break,
            }
        }
    }
    out
}

// span of the quoted value following `"key"` and a colon
fn value_span(rest: &str) -> Option<(usize, usize)> {
    let colon = rest.find(':')?;
    let open = rest[colon..].find('"')? + colon + 1;
    let close = rest[open..].find('"')? + open;
    Some((open, close))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse, ConfigFormat};

    fn aliased_provider() -> Arc<Provider> {
        let config = parse(
            r#"
server:
  auth:
    anonymous: true
providers:
  - name: main
    kind: anthropic
    model_aliases:
      fast: claude-haiku-4-5
    credentials: [{secret: sk-1}]
"#,
            ConfigFormat::Yaml,
        )
        .unwrap();
        let registry = Registry::build(&config, None).unwrap();
        registry.provider("main").unwrap().clone()
    }

    #[test]
    fn model_alias_is_spliced_to_its_canonical_name() {
        let provider = aliased_provider();
        let body = br#"{"model":"fast","max_tokens":8,"tool_use_id":"toolu_abc"}"#.to_vec();
        let rewritten = rewrite_model_alias(body, &provider);
        assert_eq!(
            rewritten,
            br#"{"model":"claude-haiku-4-5","max_tokens":8,"tool_use_id":"toolu_abc"}"#.to_vec()
        );
    }

    #[test]
    fn unaliased_models_and_odd_bodies_pass_through_byte_identical() {
        let provider = aliased_provider();
        let canonical = br#"{"model":"claude-haiku-4-5","stream":true}"#.to_vec();
        assert_eq!(rewrite_model_alias(canonical.clone(), &provider), canonical);
        let no_model = br#"{"stream":true}"#.to_vec();
        assert_eq!(rewrite_model_alias(no_model.clone(), &provider), no_model);
        let not_utf8 = vec![0xff, 0xfe, 0x00];
        assert_eq!(rewrite_model_alias(not_utf8.clone(), &provider), not_utf8);
    }

    #[test]
    fn error_statuses_map_onto_client_codes() {
        let rate_limited = Error::explain(ErrorType::HTTPStatus(429), "exhausted");
        assert_eq!(status_for_error(&rate_limited), 429);
        let open = Error::explain(ErrorType::HTTPStatus(503), "open");
        assert_eq!(status_for_error(&open), 503);
        let timeout = Error::explain(ErrorType::ReadTimedout, "idle");
        assert_eq!(status_for_error(&timeout), 504);
    }

    #[test]
    fn mask_hides_credential_fields_only() {
        let body = r#"{"model":"m","api_key":"sk-very-secret","messages":[{"tool_use_id":"toolu_abc"}]}"#;
        let masked = mask_credentials(body);
        assert!(!masked.contains("sk-very-secret"));
        assert!(masked.contains(r#""api_key":"***""#));
        // payload identifiers survive untouched
        assert!(masked.contains("toolu_abc"));
        assert!(masked.contains(r#""model":"m""#));
    }

    #[test]
    fn mask_handles_multiple_and_missing_values() {
        let body = r#"{"secret":"a","nested":{"token":"b"},"secret_like":1}"#;
        let masked = mask_credentials(body);
        assert!(!masked.contains(r#""secret":"a""#));
        assert!(!masked.contains(r#""token":"b""#));
        assert_eq!(mask_credentials("no credentials here"), "no credentials here");
    }

    #[test]
    fn hop_by_hop_headers_cover_the_classics() {
        for name in ["connection", "te", "upgrade", "proxy-authorization"] {
            assert!(HOP_BY_HOP_HEADERS.contains(&name));
        }
        // end-to-end headers must survive the copy
        for name in ["content-type", "accept", "anthropic-version"] {
            assert!(!HOP_BY_HOP_HEADERS.contains(&name));
        }
    }
}
