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

use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::config::validate::{validate, ValidationReport};
use crate::config::ProxyConfig;

// enum config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    // format is keyed by file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config extension {0:?}, expected .yaml, .yml or .toml")]
    UnsupportedFormat(String),
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config syntax: {0}")]
    Syntax(String),
    #[error("config validation failed:\n{0}")]
    Validation(ValidationReport),
}

/// Expands `${NAME}` references from the process environment.
///
/// Runs over the raw text before structural parsing so secrets can live in
/// the environment regardless of where the value sits in the document.
/// Unset variables expand to the empty string and are warned about at load
/// time, once per name; validation then reports any mandatory field that
/// ended up empty.
pub fn expand_env(raw: &str) -> String {
    let mut unset = Vec::new();
    let expanded = expand_env_tracking(raw, &mut unset);
    for name in unset {
        warn!(
            event = "config_expand",
            var = %name,
            "undefined environment variable expanded to an empty string"
        );
    }
    expanded
}

fn expand_env_tracking(raw: &str, unset: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    match std::env::var(name) {
                        Ok(value) => out.push_str(&value),
                        Err(_) => {
                            if !unset.iter().any(|seen| seen == name) {
                                unset.push(name.to_string());
                            }
                        }
                    }
                } else {
                    // not a variable reference, keep the literal text
                    out.push_str(&rest[start..start + 2 + end + 1]);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parses and validates config text in the given format.
pub fn parse(text: &str, format: ConfigFormat) -> Result<ProxyConfig, ConfigError> {
    let expanded = expand_env(text);
    let config: ProxyConfig = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::Syntax(e.to_string()))?
        }
        ConfigFormat::Toml => {
            toml::from_str(&expanded).map_err(|e| ConfigError::Syntax(e.to_string()))?
        }
    };
    let report = validate(&config);
    if report.is_empty() {
        Ok(config)
    } else {
        Err(ConfigError::Validation(report))
    }
}

/// Loads, parses and validates the config file at `path`.
pub fn load(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_YAML: &str = r#"
server:
  bind: "127.0.0.1:6188"
  auth:
    api_key:
      secret: "proxy-key"
providers:
  - name: main
    kind: anthropic
    credentials:
      - secret: "sk-ant-test"
"#;

    #[test]
    fn parses_minimal_yaml() {
        let config = parse(MINIMAL_YAML, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name, "main");
        assert_eq!(config.server.bind, "127.0.0.1:6188");
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
[server]
bind = "127.0.0.1:6188"

[server.auth.api_key]
secret = "proxy-key"

[[providers]]
name = "main"
kind = "anthropic"

[[providers.credentials]]
secret = "sk-ant-test"
"#;
        let config = parse(text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.providers[0].credentials.len(), 1);
    }

    #[test]
    fn format_keyed_by_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("relay.yaml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("relay.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("relay.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert!(matches!(
            ConfigFormat::from_path(Path::new("relay.ini")),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn expands_env_references() {
        std::env::set_var("RELAY_TEST_SECRET", "sk-expanded");
        let out = expand_env("secret: \"${RELAY_TEST_SECRET}\"");
        assert_eq!(out, "secret: \"sk-expanded\"");
    }

    #[test]
    fn unset_env_expands_empty_and_is_tracked() {
        std::env::remove_var("RELAY_TEST_UNSET");
        let mut unset = Vec::new();
        let out = expand_env_tracking(
            "a=${RELAY_TEST_UNSET}b c=${RELAY_TEST_UNSET}",
            &mut unset,
        );
        assert_eq!(out, "a=b c=");
        // one warning per name, not per reference
        assert_eq!(unset, vec!["RELAY_TEST_UNSET".to_string()]);

        std::env::set_var("RELAY_TEST_SET", "x");
        let mut unset = Vec::new();
        expand_env_tracking("${RELAY_TEST_SET}", &mut unset);
        assert!(unset.is_empty());
    }

    #[test]
    fn malformed_references_kept_literal() {
        assert_eq!(expand_env("${not a var}"), "${not a var}");
        assert_eq!(expand_env("tail ${OPEN"), "tail ${OPEN");
        assert_eq!(expand_env("${}"), "${}");
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = parse("server: [unbalanced", ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(MINIMAL_YAML.as_bytes()).unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.providers[0].name, "main");
    }
}
