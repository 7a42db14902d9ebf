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

use std::collections::HashSet;
use std::fmt;

use crate::config::logging::{LOG_FORMATS, LOG_LEVELS};
use crate::config::provider::{ProviderKind, PROVIDER_KINDS};
use crate::config::routing::ROUTING_STRATEGIES;
use crate::config::server::ClientAuth;
use crate::config::ProxyConfig;
use crate::strategy;

// one defect, located by a dotted path into the document
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub path: String,
    pub message: String,
}

// every defect found in one pass, not just the first
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            path: path.into(),
            message: message.into(),
        });
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}: {}", d.path, d.message)?;
        }
        Ok(())
    }
}

/// Walks the whole config and collects every defect.
pub fn validate(config: &ProxyConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_server(config, &mut report);
    validate_providers(config, &mut report);
    validate_routing(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_server(config: &ProxyConfig, report: &mut ValidationReport) {
    let server = &config.server;
    if !is_host_port(&server.bind) {
        report.push("server.bind", format!("{:?} is not host:port", server.bind));
    }
    match &server.auth {
        None => report.push(
            "server.auth",
            "a client auth mode is required; set anonymous: true to opt out",
        ),
        Some(ClientAuth::ApiKey { api_key }) => {
            if api_key.secret.is_empty() {
                report.push("server.auth.api_key.secret", "must not be empty");
            }
        }
        Some(ClientAuth::Bearer { bearer }) => {
            if bearer.token.is_empty() {
                report.push("server.auth.bearer.token", "must not be empty");
            }
        }
        Some(ClientAuth::Passthrough { passthrough }) => {
            if passthrough.prefix.is_empty() {
                report.push("server.auth.passthrough.prefix", "must not be empty");
            }
        }
        Some(ClientAuth::Anonymous { anonymous }) => {
            if !*anonymous {
                report.push(
                    "server.auth.anonymous",
                    "anonymous access must be enabled explicitly or another mode configured",
                );
            }
        }
    }
    if server.paths.is_empty() {
        report.push("server.paths", "at least one forwarded path is required");
    }
    for (i, path) in server.paths.iter().enumerate() {
        if !path.starts_with('/') {
            report.push(format!("server.paths[{}]", i), "must start with /");
        }
    }
    if server.read_timeout_ms < 1_000 {
        report.push(
            "server.read_timeout_ms",
            "must be at least 1000 to ride out gaps between stream events",
        );
    }
}

fn validate_providers(config: &ProxyConfig, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for (i, provider) in config.providers.iter().enumerate() {
        let base = format!("providers[{}]", i);
        if provider.name.is_empty() {
            report.push(format!("{}.name", base), "must not be empty");
        }
        if !seen.insert(provider.name.as_str()) {
            report.push(
                format!("{}.name", base),
                format!("duplicate provider name {:?}", provider.name),
            );
        }
        if provider.enabled && provider.credentials.is_empty() {
            report.push(
                format!("{}.credentials", base),
                "an enabled provider needs at least one credential",
            );
        }
        if !strategy::is_known(&provider.pool.strategy) {
            report.push(
                format!("{}.pool.strategy", base),
                format!(
                    "unknown strategy {:?}, expected one of {}",
                    provider.pool.strategy,
                    strategy::STRATEGY_NAMES.join(", ")
                ),
            );
        }
        if let Some(url) = &provider.base_url {
            if !is_http_url(url) {
                report.push(
                    format!("{}.base_url", base),
                    format!("{:?} is not an absolute http(s) url", url),
                );
            }
        }
        match provider.parsed_kind() {
            Some(kind) => validate_cloud_fields(kind, provider, &base, report),
            None => report.push(
                format!("{}.kind", base),
                format!(
                    "unrecognized provider kind {:?}, expected one of {}",
                    provider.kind,
                    PROVIDER_KINDS.join(", ")
                ),
            ),
        }
        for (j, credential) in provider.credentials.iter().enumerate() {
            let cred_base = format!("{}.credentials[{}]", base, j);
            if credential.secret.is_empty() {
                report.push(format!("{}.secret", cred_base), "must not be empty");
            }
            if credential.weight < 1 {
                report.push(format!("{}.weight", cred_base), "must be at least 1");
            }
            if credential.priority > 2 {
                report.push(format!("{}.priority", cred_base), "must be 0, 1 or 2");
            }
        }
    }
}

fn validate_cloud_fields(
    kind: ProviderKind,
    provider: &crate::config::ProviderConfig,
    base: &str,
    report: &mut ValidationReport,
) {
    match kind {
        ProviderKind::Bedrock => {
            if provider.region.is_none() {
                report.push(format!("{}.region", base), "bedrock requires a region");
            }
        }
        ProviderKind::Vertex => {
            if provider.region.is_none() {
                report.push(format!("{}.region", base), "vertex requires a region");
            }
            if provider.project_id.is_none() {
                report.push(format!("{}.project_id", base), "vertex requires a project id");
            }
        }
        _ => {
            if provider.region.is_some() {
                report.push(
                    format!("{}.region", base),
                    format!("not applicable to the {} kind", kind.as_str()),
                );
            }
            if provider.project_id.is_some() {
                report.push(
                    format!("{}.project_id", base),
                    format!("not applicable to the {} kind", kind.as_str()),
                );
            }
        }
    }
}

fn validate_routing(config: &ProxyConfig, report: &mut ValidationReport) {
    if !ROUTING_STRATEGIES.contains(&config.routing.strategy.as_str()) {
        report.push(
            "routing.strategy",
            format!(
                "unknown strategy {:?}, expected one of {}",
                config.routing.strategy,
                ROUTING_STRATEGIES.join(", ")
            ),
        );
    }
    if let Some(name) = &config.routing.provider {
        if !config.providers.iter().any(|p| &p.name == name) {
            report.push(
                "routing.provider",
                format!("{:?} does not name a configured provider", name),
            );
        }
    }
}

fn validate_logging(config: &ProxyConfig, report: &mut ValidationReport) {
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        report.push(
            "logging.level",
            format!("unknown level {:?}", config.logging.level),
        );
    }
    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
        report.push(
            "logging.format",
            format!("unknown format {:?}", config.logging.format),
        );
    }
}

fn is_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn is_http_url(value: &str) -> bool {
    match value.parse::<http::Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.host().is_some()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{loader, ConfigFormat};

    fn parse_yaml(text: &str) -> ProxyConfig {
        // bypass the validating entry to inspect the raw report
        serde_yaml::from_str(&loader::expand_env(text)).unwrap()
    }

    #[test]
    fn clean_config_passes() {
        let config = parse_yaml(
            r#"
server:
  auth:
    anonymous: true
providers:
  - name: main
    kind: anthropic
    credentials:
      - secret: sk-1
"#,
        );
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn collects_every_defect_with_distinct_paths() {
        // five independent defects: bad bind, missing auth mode, empty
        // credential secret, zero weight, unknown pool strategy
        let config = parse_yaml(
            r#"
server:
  bind: "nonsense"
providers:
  - name: main
    kind: anthropic
    pool:
      strategy: mystery
    credentials:
      - secret: ""
        weight: 0
"#,
        );
        let report = validate(&config);
        assert!(report.diagnostics.len() >= 5, "report: {}", report);
        let paths: HashSet<_> = report.diagnostics.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths.len(), report.diagnostics.len());
        assert!(paths.contains("providers[0].credentials[0].weight"));
        assert!(paths.contains("providers[0].pool.strategy"));
    }

    #[test]
    fn unrecognized_kind_is_one_diagnostic_among_many() {
        // a bad kind must not eat the report: bad bind, bad kind, empty
        // secret and zero weight all surface together
        let config = parse_yaml(
            r#"
server:
  bind: "nonsense"
  auth:
    anonymous: true
providers:
  - name: main
    kind: mystery
    credentials:
      - secret: ""
        weight: 0
"#,
        );
        let report = validate(&config);
        let paths: Vec<_> = report.diagnostics.iter().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"server.bind"));
        assert!(paths.contains(&"providers[0].kind"));
        assert!(paths.contains(&"providers[0].credentials[0].secret"));
        assert!(paths.contains(&"providers[0].credentials[0].weight"));
        assert!(report.diagnostics.len() >= 4, "report: {}", report);
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let config = parse_yaml(
            r#"
server:
  auth:
    anonymous: true
providers:
  - name: main
    kind: anthropic
    credentials: [{secret: sk-1}]
  - name: main
    kind: zai
    credentials: [{secret: sk-2}]
"#,
        );
        let report = validate(&config);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.path == "providers[1].name"));
    }

    #[test]
    fn cloud_fields_must_match_kind() {
        let config = parse_yaml(
            r#"
server:
  auth:
    anonymous: true
providers:
  - name: aws
    kind: bedrock
    credentials: [{secret: sk-1}]
  - name: plain
    kind: anthropic
    region: us-east-1
    credentials: [{secret: sk-2}]
"#,
        );
        let report = validate(&config);
        assert!(report.diagnostics.iter().any(|d| d.path == "providers[0].region"));
        assert!(report.diagnostics.iter().any(|d| d.path == "providers[1].region"));
    }

    #[test]
    fn disabled_provider_may_have_no_credentials() {
        let config = parse_yaml(
            r#"
server:
  auth:
    anonymous: true
providers:
  - name: parked
    kind: anthropic
    enabled: false
"#,
        );
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn validation_surfaces_through_parse() {
        let err = loader::parse(
            "server:\n  bind: broken\n",
            ConfigFormat::Yaml,
        )
        .unwrap_err();
        match err {
            loader::ConfigError::Validation(report) => {
                assert!(report.diagnostics.iter().any(|d| d.path == "server.bind"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
