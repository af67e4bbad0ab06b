pub mod adapter;
pub mod config;
pub mod registry;
pub mod response_manager;
pub mod supervisor;
pub mod tunnel;

pub use adapter::{BackendAdapter, BackendStatus, DiscoveredHost};
pub use config::{
  CliArgs, EngineConfig, EngineEnv, engine_config, response_rate_limiter,
};
pub use registry::{ProvisionerRegistry, resolve_config};
pub use response_manager::ResponseManager;
pub use supervisor::KernelSupervisor;
pub use tunnel::Tunneler;
