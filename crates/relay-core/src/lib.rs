//! The relay's engine: configuration snapshots, routing, queue selection,
//! the request executor, and the upstream HTTP client.

pub mod config;
pub mod executor;
pub mod glob;
pub mod router;
pub mod selector;
pub mod state;
pub mod task;
pub mod upstream;

pub use config::{ConfigError, ConfigSnapshot, Provider, ProviderMode, ProviderType};
pub use executor::RelayExecutor;
pub use router::RouteAction;
pub use selector::QueueSelector;
pub use state::RelayState;
pub use task::{ClientSink, RelayTask, ResponseHead};
pub use upstream::{
    HttpMethod, UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamRequest,
    UpstreamResponse, WreqUpstreamClient,
};
