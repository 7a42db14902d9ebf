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

use arc_swap::ArcSwap;
use pingora::http::RequestHeader;
use tracing::warn;

use crate::breaker::Breaker;
use crate::config::{ProviderConfig, ProviderKind, ProxyConfig, RoutingConfig};
use crate::pool::CredentialPool;

// where a provider lives on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub sni: String,
    /// Prepended to the request path, empty for root-mounted dialects.
    pub path_prefix: String,
}

impl Endpoint {
    fn from_config(kind: ProviderKind, config: &ProviderConfig) -> Result<Self, String> {
        let url = match &config.base_url {
            Some(url) => url.clone(),
            None => default_base_url(kind, config)?,
        };
        let uri: http::Uri = url
            .parse()
            .map_err(|e| format!("provider {}: bad base url: {}", config.name, e))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(format!(
                    "provider {}: unsupported scheme {:?}",
                    config.name, other
                ))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| format!("provider {}: base url has no host", config.name))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let path_prefix = uri.path().trim_end_matches('/').to_string();
        Ok(Endpoint {
            sni: host.clone(),
            host,
            port,
            tls,
            path_prefix,
        })
    }
}

fn default_base_url(kind: ProviderKind, config: &ProviderConfig) -> Result<String, String> {
    match kind {
        ProviderKind::Anthropic => Ok("https://api.anthropic.com".to_string()),
        ProviderKind::Zai => Ok("https://api.z.ai/api/anthropic".to_string()),
        ProviderKind::Ollama => Ok("http://127.0.0.1:11434".to_string()),
        ProviderKind::Bedrock => {
            let region = config
                .region
                .as_deref()
                .ok_or_else(|| format!("provider {}: bedrock requires a region", config.name))?;
            Ok(format!("https://bedrock-runtime.{}.amazonaws.com", region))
        }
        ProviderKind::Vertex => {
            let region = config
                .region
                .as_deref()
                .ok_or_else(|| format!("provider {}: vertex requires a region", config.name))?;
            let project = config.project_id.as_deref().ok_or_else(|| {
                format!("provider {}: vertex requires a project id", config.name)
            })?;
            Ok(format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/anthropic"
            ))
        }
    }
}

// enum upstream auth scheme, a thin rewrite per dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthScheme {
    XApiKey,
    Bearer,
    None,
}

fn auth_scheme(kind: ProviderKind) -> AuthScheme {
    match kind {
        ProviderKind::Anthropic => AuthScheme::XApiKey,
        ProviderKind::Zai | ProviderKind::Bedrock | ProviderKind::Vertex => AuthScheme::Bearer,
        ProviderKind::Ollama => AuthScheme::None,
    }
}

/// One routable upstream provider with its pool and breaker.
pub struct Provider {
    config: ProviderConfig,
    kind: ProviderKind,
    pub endpoint: Endpoint,
    auth: AuthScheme,
    pub pool: CredentialPool,
    pub breaker: Breaker,
}

impl Provider {
    fn build(config: &ProviderConfig, previous: Option<&Provider>) -> Result<Self, String> {
        // validation reports unknown kinds with a path; this guard keeps the
        // build total for callers that skipped it
        let kind = config.parsed_kind().ok_or_else(|| {
            format!(
                "provider {}: unrecognized kind {:?}",
                config.name, config.kind
            )
        })?;
        let endpoint = Endpoint::from_config(kind, config)?;
        let pool = CredentialPool::build(config, previous.map(|p| &p.pool));
        let breaker = Breaker::new(config.name.clone(), config.breaker.clone());
        Ok(Provider {
            auth: auth_scheme(kind),
            kind,
            endpoint,
            pool,
            breaker,
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Whether this provider declares any model aliases to resolve.
    pub fn has_model_aliases(&self) -> bool {
        !self.config.model_aliases.is_empty()
    }

    /// Rewrites the outgoing request to carry the chosen secret.
    pub fn rewrite_auth(
        &self,
        upstream: &mut RequestHeader,
        secret: &str,
    ) -> pingora::Result<()> {
        match self.auth {
            AuthScheme::XApiKey => {
                upstream.insert_header("x-api-key", secret)?;
            }
            AuthScheme::Bearer => {
                upstream.insert_header("authorization", format!("Bearer {}", secret))?;
            }
            AuthScheme::None => {}
        }
        Ok(())
    }

    /// Resolves a model alias to its canonical name.
    pub fn canonical_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.config
            .model_aliases
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

/// Pure function of the current config: name to wire endpoint, auth rewrite
/// and model capabilities.
///
/// Rebuilds are keyed: a provider whose definition is unchanged keeps its
/// exact entry, pool and breaker included, so a reload never churns live
/// credential state.
pub struct Registry {
    providers: Vec<Arc<Provider>>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn build(config: &ProxyConfig, previous: Option<&Registry>) -> Result<Self, String> {
        let mut providers = Vec::new();
        let mut by_name = HashMap::new();
        for provider_config in config.providers.iter().filter(|p| p.enabled) {
            let prev = previous.and_then(|r| r.provider(&provider_config.name));
            let provider = match prev {
                Some(existing) if existing.config == *provider_config => existing.clone(),
                _ => Arc::new(Provider::build(provider_config, prev.map(Arc::as_ref))?),
            };
            by_name.insert(provider_config.name.clone(), providers.len());
            providers.push(provider);
        }
        Ok(Registry { providers, by_name })
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<Provider>> {
        self.by_name.get(name).map(|i| &self.providers[*i])
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider indexes in try order for one request.
    ///
    /// The primary comes first; with the failover routing strategy the
    /// remaining providers follow in config order.
    pub fn route_order(&self, routing: &RoutingConfig) -> Vec<usize> {
        if self.providers.is_empty() {
            return Vec::new();
        }
        let primary = routing
            .provider
            .as_ref()
            .and_then(|name| self.by_name.get(name).copied())
            .unwrap_or(0);
        if routing.is_failover() {
            let mut order = vec![primary];
            order.extend((0..self.providers.len()).filter(|i| *i != primary));
            order
        } else {
            vec![primary]
        }
    }
}

/// Live registry pointer, swapped on reload.
pub struct RegistryHandle {
    inner: ArcSwap<Registry>,
}

impl RegistryHandle {
    pub fn new(initial: Arc<Registry>) -> Self {
        RegistryHandle {
            inner: ArcSwap::new(initial),
        }
    }

    pub fn get(&self) -> Arc<Registry> {
        self.inner.load_full()
    }

    /// Rebuilds from a validated config, keeping unchanged providers.
    pub fn rebuild(&self, config: &ProxyConfig) {
        let current = self.get();
        match Registry::build(config, Some(&current)) {
            Ok(next) => self.inner.store(Arc::new(next)),
            Err(detail) => warn!(event = "reload", reload_ok = false, detail),
        }
    }
}
