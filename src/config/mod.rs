pub mod loader;
pub mod schema;

pub use loader::{default_config_path, default_database_path, load_config, load_default_config, save_config};
pub use schema::{
    AgentConfig, AppConfig, DiscordConfig, PipelineConfig, ReconcilerConfig, RoutingConfig,
    SandboxConfig, SandboxProviderConfig, SandboxReusePolicy, StoreConfig, TurnRoutingMode,
};
