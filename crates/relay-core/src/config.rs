use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use relay_queue::ConcurrencyConfig;

use crate::glob::Glob;
use crate::router::RouteRules;

pub const DEFAULT_PASSTHROUGH_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("duplicate provider id {0:?}")]
    DuplicateProvider(String),
    #[error("unknown provider id {0:?}")]
    UnknownProvider(String),
    #[error("provider {0:?} is disabled")]
    DisabledProvider(String),
    #[error("max concurrency must be at least 1")]
    InvalidConcurrency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Passthrough,
    Inject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMapRule {
    pub pattern: String,
    pub model: String,
}

/// Provider as written in the configuration file. Accepts both snake_case
/// and the legacy camelCase field spellings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "baseUrl")]
    pub base_url: String,
    pub mode: ProviderMode,
    #[serde(alias = "providerType")]
    pub provider_type: ProviderType,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, alias = "authHeader")]
    pub auth_header: Option<String>,
    #[serde(default, alias = "modelMap")]
    pub model_map: Vec<ModelMapRule>,
    #[serde(default, alias = "vlModelMap")]
    pub vl_model_map: Vec<ModelMapRule>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Ordered model-name mapping with patterns compiled once.
#[derive(Debug, Clone, Default)]
pub struct ModelMap {
    entries: Vec<(Glob, String)>,
}

impl ModelMap {
    fn from_rules(rules: &[ModelMapRule]) -> Self {
        Self {
            entries: rules
                .iter()
                .map(|rule| (Glob::new(&rule.pattern), rule.model.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First matching entry wins.
    pub fn resolve(&self, model: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(glob, _)| glob.matches(model))
            .map(|(_, target)| target.as_str())
    }
}

/// Immutable provider snapshot handed to tasks.
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub mode: ProviderMode,
    pub provider_type: ProviderType,
    pub api_key: Option<String>,
    pub auth_header: String,
    pub model_map: ModelMap,
    pub vl_model_map: ModelMap,
    pub headers: Vec<(String, String)>,
    pub enabled: bool,
}

impl Provider {
    pub fn from_spec(spec: &ProviderSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
            base_url: spec.base_url.trim_end_matches('/').to_string(),
            mode: spec.mode,
            provider_type: spec.provider_type,
            api_key: spec.api_key.clone(),
            auth_header: spec
                .auth_header
                .clone()
                .unwrap_or_else(|| "authorization".to_string())
                .to_ascii_lowercase(),
            model_map: ModelMap::from_rules(&spec.model_map),
            vl_model_map: ModelMap::from_rules(&spec.vl_model_map),
            headers: spec
                .headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
            enabled: spec.enabled,
        }
    }

    /// The synthetic provider behind passthrough routes: the official
    /// Anthropic endpoint, caller auth forwarded untouched.
    pub fn passthrough(base_url: &str) -> Self {
        Self {
            id: "passthrough".to_string(),
            name: "passthrough".to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            mode: ProviderMode::Passthrough,
            provider_type: ProviderType::Anthropic,
            api_key: None,
            auth_header: "authorization".to_string(),
            model_map: ModelMap::default(),
            vl_model_map: ModelMap::default(),
            headers: Vec::new(),
            enabled: true,
        }
    }

    /// Resolve the upstream model name. Requests carrying image content
    /// consult the vision map first.
    pub fn resolve_model(&self, model: &str, has_image: bool) -> Option<&str> {
        if has_image && !self.vl_model_map.is_empty() {
            return self.vl_model_map.resolve(model);
        }
        self.model_map.resolve(model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Proxy,
    Passthrough,
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRuleSpec {
    pub pattern: String,
    pub kind: RouteKind,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default, alias = "responseCode")]
    pub response_code: Option<u16>,
}

/// Concurrency settings as written in the file. Normalizes the legacy
/// `{maxWorkers, requestTimeout}` spelling, whose timeout is in seconds,
/// into `{max_concurrency, timeout_ms}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencySpec {
    #[serde(default, alias = "maxConcurrency")]
    pub max_concurrency: Option<usize>,
    #[serde(default, rename = "maxWorkers")]
    pub max_workers: Option<usize>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default, rename = "requestTimeout")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default, alias = "maxQueueSize")]
    pub max_queue_size: Option<usize>,
}

impl ConcurrencySpec {
    pub fn normalize(&self) -> Result<ConcurrencyConfig, ConfigError> {
        let max_concurrency = self
            .max_concurrency
            .or(self.max_workers)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        let timeout_ms = self
            .timeout_ms
            .or(self.request_timeout_secs.map(|secs| secs * 1000))
            .unwrap_or(0);
        Ok(ConcurrencyConfig {
            max_concurrency,
            max_queue_size: self.max_queue_size.unwrap_or(0),
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteQueueSpec {
    pub pattern: String,
    #[serde(flatten)]
    pub concurrency: ConcurrencySpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamSpec {
    #[serde(default, alias = "socketTimeoutMs")]
    pub socket_timeout_ms: Option<u64>,
    #[serde(default, alias = "passthroughBaseUrl")]
    pub passthrough_base_url: Option<String>,
}

/// Root of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySpec {
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    #[serde(default, alias = "currentProvider")]
    pub current_provider: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteRuleSpec>,
    #[serde(default, alias = "routeQueues")]
    pub route_queues: Vec<RouteQueueSpec>,
    #[serde(default)]
    pub concurrency: ConcurrencySpec,
    #[serde(default)]
    pub upstream: UpstreamSpec,
}

#[derive(Debug, Clone)]
pub struct RouteQueueBinding {
    pub name: String,
    pub pattern: Regex,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub socket_timeout_ms: u64,
    pub passthrough_base_url: String,
}

/// A fully resolved, immutable configuration snapshot: patterns compiled,
/// legacy spellings normalized, providers indexed.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub providers: HashMap<String, Arc<Provider>>,
    pub current_provider_id: Option<String>,
    pub rules: RouteRules,
    pub route_queues: Vec<RouteQueueBinding>,
    pub default_concurrency: ConcurrencyConfig,
    pub upstream: UpstreamSettings,
    pub passthrough_provider: Arc<Provider>,
}

impl ConfigSnapshot {
    pub fn from_spec(spec: &RelaySpec) -> Result<Self, ConfigError> {
        let mut providers = HashMap::new();
        for provider_spec in &spec.providers {
            let provider = Arc::new(Provider::from_spec(provider_spec));
            if providers.insert(provider.id.clone(), provider).is_some() {
                return Err(ConfigError::DuplicateProvider(provider_spec.id.clone()));
            }
        }

        // A configured current provider must exist and be enabled.
        if let Some(id) = &spec.current_provider {
            match providers.get(id) {
                None => return Err(ConfigError::UnknownProvider(id.clone())),
                Some(provider) if !provider.enabled => {
                    return Err(ConfigError::DisabledProvider(id.clone()));
                }
                Some(_) => {}
            }
        }

        let rules = RouteRules::compile(&spec.routes)?;

        let mut route_queues = Vec::new();
        for queue_spec in &spec.route_queues {
            let pattern =
                Regex::new(&queue_spec.pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: queue_spec.pattern.clone(),
                    source,
                })?;
            route_queues.push(RouteQueueBinding {
                name: queue_spec.pattern.clone(),
                pattern,
                concurrency: queue_spec.concurrency.normalize()?,
            });
        }

        let upstream = UpstreamSettings {
            socket_timeout_ms: spec
                .upstream
                .socket_timeout_ms
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_MS),
            passthrough_base_url: spec
                .upstream
                .passthrough_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_PASSTHROUGH_BASE_URL.to_string()),
        };
        let passthrough_provider = Arc::new(Provider::passthrough(&upstream.passthrough_base_url));

        Ok(Self {
            providers,
            current_provider_id: spec.current_provider.clone(),
            rules,
            route_queues,
            default_concurrency: spec.concurrency.normalize()?,
            upstream,
            passthrough_provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(value: serde_json::Value) -> RelaySpec {
        serde_json::from_value(value).expect("config fixture")
    }

    #[test]
    fn legacy_concurrency_spelling_is_normalized() {
        let parsed: ConcurrencySpec =
            serde_json::from_value(serde_json::json!({"maxWorkers": 4, "requestTimeout": 2}))
                .unwrap();
        let config = parsed.normalize().unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.timeout_ms, 2000);

        let parsed: ConcurrencySpec =
            serde_json::from_value(serde_json::json!({"max_concurrency": 2, "timeout": 150}))
                .unwrap();
        let config = parsed.normalize().unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.timeout_ms, 150);
    }

    #[test]
    fn current_provider_must_be_enabled() {
        let result = ConfigSnapshot::from_spec(&spec(serde_json::json!({
            "providers": [{
                "id": "p1",
                "base_url": "https://up.test",
                "mode": "inject",
                "provider_type": "openai",
                "enabled": false
            }],
            "current_provider": "p1"
        })));
        assert!(matches!(result, Err(ConfigError::DisabledProvider(_))));

        let result = ConfigSnapshot::from_spec(&spec(serde_json::json!({
            "providers": [],
            "current_provider": "ghost"
        })));
        assert!(matches!(result, Err(ConfigError::UnknownProvider(_))));
    }

    #[test]
    fn model_map_first_match_wins() {
        let provider = Provider::from_spec(
            &serde_json::from_value(serde_json::json!({
                "id": "p",
                "base_url": "https://up.test",
                "mode": "inject",
                "provider_type": "openai",
                "model_map": [
                    {"pattern": "claude-3-5-*", "model": "gpt-4o"},
                    {"pattern": "claude-*", "model": "gpt-4o-mini"}
                ],
                "vl_model_map": [
                    {"pattern": "*", "model": "gpt-4o-vision"}
                ]
            }))
            .unwrap(),
        );
        assert_eq!(
            provider.resolve_model("claude-3-5-sonnet-20241022", false),
            Some("gpt-4o")
        );
        assert_eq!(
            provider.resolve_model("claude-2", false),
            Some("gpt-4o-mini")
        );
        assert_eq!(provider.resolve_model("gemini", false), None);
        assert_eq!(
            provider.resolve_model("claude-3-5-sonnet-20241022", true),
            Some("gpt-4o-vision")
        );
    }
}
