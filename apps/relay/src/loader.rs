use std::path::Path;

use anyhow::Context;
use regex::{Captures, Regex};

use relay_core::config::RelaySpec;

/// Load the configuration file, expanding `${VAR}` references in the raw
/// text from the environment before parsing. Unset variables expand to the
/// empty string.
pub(crate) fn load_spec(path: impl AsRef<Path>) -> anyhow::Result<RelaySpec> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let expanded = expand_env(&raw);
    let spec: RelaySpec = serde_json::from_str(&expanded)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok(spec)
}

fn expand_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    pattern
        .replace_all(raw, |captures: &Captures<'_>| {
            std::env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables_and_blanks_unknown_ones() {
        // SAFETY: test-local variable, no concurrent reader cares.
        unsafe { std::env::set_var("RELAY_TEST_KEY", "sk-123") };
        let out = expand_env("{\"api_key\": \"${RELAY_TEST_KEY}\", \"x\": \"${RELAY_UNSET_VAR}\"}");
        assert_eq!(out, "{\"api_key\": \"sk-123\", \"x\": \"\"}");
    }
}
