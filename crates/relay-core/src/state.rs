use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::config::{ConfigError, ConfigSnapshot, Provider};

/// Shared runtime state: the resolved configuration snapshot and the
/// currently selected provider. Reads are lock-free snapshots; selection
/// swaps atomically and is validated against the provider table.
pub struct RelayState {
    config: ArcSwap<ConfigSnapshot>,
    current_provider_id: ArcSwapOption<String>,
}

impl RelayState {
    pub fn new(config: ConfigSnapshot) -> Arc<Self> {
        let current = config.current_provider_id.clone();
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            current_provider_id: ArcSwapOption::from(current.map(Arc::new)),
        })
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.load_full()
    }

    /// The currently selected provider, if one is selected and enabled.
    pub fn current_provider(&self) -> Option<Arc<Provider>> {
        let id = self.current_provider_id.load_full()?;
        self.config
            .load()
            .providers
            .get(id.as_str())
            .filter(|provider| provider.enabled)
            .cloned()
    }

    /// Switch the active provider. Only enabled, known providers are
    /// admissible.
    pub fn select_provider(&self, id: &str) -> Result<(), ConfigError> {
        let config = self.config.load();
        match config.providers.get(id) {
            None => Err(ConfigError::UnknownProvider(id.to_string())),
            Some(provider) if !provider.enabled => {
                Err(ConfigError::DisabledProvider(id.to_string()))
            }
            Some(_) => {
                self.current_provider_id
                    .store(Some(Arc::new(id.to_string())));
                Ok(())
            }
        }
    }

    pub fn passthrough_provider(&self) -> Arc<Provider> {
        self.config.load().passthrough_provider.clone()
    }
}
