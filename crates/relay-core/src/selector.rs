use std::sync::Arc;

use regex::Regex;

use relay_queue::{ConcurrencyManager, InvalidPermits};

use crate::config::ConfigSnapshot;
use crate::executor::RelayExecutor;

pub type RelayManager = ConcurrencyManager<RelayExecutor>;

/// Maps an inbound path to the admission pool that owns it. Bindings are
/// checked in declaration order; the first matching pattern wins, and
/// everything else lands in the default pool.
pub struct QueueSelector {
    bindings: Vec<(Regex, Arc<RelayManager>)>,
    default_manager: Arc<RelayManager>,
}

impl QueueSelector {
    pub fn from_config(
        config: &ConfigSnapshot,
        executor: Arc<RelayExecutor>,
    ) -> Result<Self, InvalidPermits> {
        let default_manager =
            ConcurrencyManager::new("default", config.default_concurrency, executor.clone())?;
        let mut bindings = Vec::new();
        for binding in &config.route_queues {
            let manager =
                ConcurrencyManager::new(&binding.name, binding.concurrency, executor.clone())?;
            bindings.push((binding.pattern.clone(), manager));
        }
        Ok(Self {
            bindings,
            default_manager,
        })
    }

    pub fn select(&self, path: &str) -> &Arc<RelayManager> {
        self.bindings
            .iter()
            .find(|(pattern, _)| pattern.is_match(path))
            .map(|(_, manager)| manager)
            .unwrap_or(&self.default_manager)
    }

    /// Every pool, default first. Used for stats and shutdown.
    pub fn managers(&self) -> Vec<Arc<RelayManager>> {
        let mut managers = vec![self.default_manager.clone()];
        managers.extend(self.bindings.iter().map(|(_, manager)| manager.clone()));
        managers
    }

    pub fn shutdown_all(&self) {
        for manager in self.managers() {
            manager.shutdown();
        }
    }
}
