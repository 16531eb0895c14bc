use regex::Regex;

use crate::config::{ConfigError, RouteKind, RouteRuleSpec};

/// What the front end should do with an inbound path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Forward to the currently selected provider, translating as needed.
    Proxy,
    /// Forward untouched to the official Anthropic endpoint.
    Passthrough,
    /// Short-circuit with a canned response; never reaches a queue.
    Block { status: u16, body: String },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: Regex,
    kind: RouteKind,
    response: Option<String>,
    response_code: Option<u16>,
}

/// Route rules in declaration order. Block rules outrank passthrough rules,
/// which outrank the default proxy action.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
    rules: Vec<CompiledRule>,
}

impl RouteRules {
    pub fn compile(specs: &[RouteRuleSpec]) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for spec in specs {
            let pattern = Regex::new(&spec.pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: spec.pattern.clone(),
                source,
            })?;
            rules.push(CompiledRule {
                pattern,
                kind: spec.kind,
                response: spec.response.clone(),
                response_code: spec.response_code,
            });
        }
        Ok(Self { rules })
    }

    pub fn action(&self, path: &str) -> RouteAction {
        for rule in &self.rules {
            if rule.kind == RouteKind::Block && rule.pattern.is_match(path) {
                return RouteAction::Block {
                    status: rule.response_code.unwrap_or(200),
                    body: rule.response.clone().unwrap_or_default(),
                };
            }
        }
        for rule in &self.rules {
            if rule.kind == RouteKind::Passthrough && rule.pattern.is_match(path) {
                return RouteAction::Passthrough;
            }
        }
        RouteAction::Proxy
    }
}
