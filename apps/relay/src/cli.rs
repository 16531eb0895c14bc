use clap::Parser;

#[derive(Parser)]
#[command(name = "relay", about = "Local reverse proxy for Anthropic Messages clients")]
pub(crate) struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "RELAY_CONFIG", default_value = "relay.json")]
    pub(crate) config: String,
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 3210)]
    pub(crate) port: u16,
}
