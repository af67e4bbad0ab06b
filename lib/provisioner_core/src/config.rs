use std::{collections::HashSet, sync::OnceLock};

use clap::Parser;
use provisioner_client::config::{
  LoadBalancingAlgorithm, ProvisionerConfig,
};
use serde::Deserialize;

/// Raw `GP_*` environment variables, parsed with `envy`. Every field
/// has a production-sane default so a bare `cargo run` with no
/// environment at all still boots.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineEnv {
  #[serde(default = "default_response_ip")]
  pub response_ip: String,
  #[serde(default = "default_response_port")]
  pub response_port: u16,
  #[serde(default = "default_response_port_retries")]
  pub response_port_retries: u16,
  #[serde(default)]
  pub prohibited_local_ips: String,
  #[serde(default = "default_launch_timeout")]
  pub kernel_launch_timeout: u64,
  #[serde(default = "default_min_port_range_size")]
  pub min_port_range_size: u32,
  #[serde(default = "default_max_port_range_retries")]
  pub max_port_range_retries: u32,
  #[serde(default)]
  pub enable_tunneling: bool,
  #[serde(default)]
  pub impersonation_enabled: bool,
  #[serde(default = "default_load_balancing_algorithm")]
  pub load_balancing_algorithm: String,
  #[serde(default)]
  pub remote_hosts: String,
  #[serde(default = "default_ssh_port")]
  pub ssh_port: u16,
  #[serde(default)]
  pub remote_user: Option<String>,
  #[serde(default)]
  pub remote_pwd: Option<String>,
  #[serde(default)]
  pub remote_gss_ssh: bool,
  #[serde(default)]
  pub namespace: Option<String>,
  #[serde(default)]
  pub shared_namespace: bool,
  #[serde(default)]
  pub kernel_cluster_role: Option<String>,
  #[serde(default)]
  pub prohibited_uids: String,
  #[serde(default)]
  pub prohibited_gids: String,
  #[serde(default)]
  pub mirror_working_dirs: bool,
  #[serde(default)]
  pub yarn_endpoint: Option<String>,
  #[serde(default)]
  pub alt_yarn_endpoint: Option<String>,
  #[serde(default)]
  pub yarn_endpoint_security_enabled: bool,
  #[serde(default)]
  pub docker_network: Option<String>,
  #[serde(default)]
  pub authorized_users: String,
  #[serde(default)]
  pub unauthorized_users: String,
  #[serde(default = "default_log_level")]
  pub log_level: String,
  #[serde(default)]
  pub log_json: bool,
  #[serde(default)]
  pub response_rate_limit_disabled: bool,
  #[serde(default = "default_response_rate_limit_max_attempts")]
  pub response_rate_limit_max_attempts: usize,
  #[serde(default = "default_response_rate_limit_window_seconds")]
  pub response_rate_limit_window_seconds: u64,
}

fn default_ssh_port() -> u16 {
  22
}

fn default_response_ip() -> String {
  "0.0.0.0".to_string()
}
fn default_response_port() -> u16 {
  8877
}
fn default_response_port_retries() -> u16 {
  10
}
fn default_launch_timeout() -> u64 {
  30
}
fn default_min_port_range_size() -> u32 {
  port_allocator::GP_MIN_PORT_RANGE_SIZE
}
fn default_max_port_range_retries() -> u32 {
  port_allocator::GP_MAX_PORT_RANGE_RETRIES
}
fn default_load_balancing_algorithm() -> String {
  "round-robin".to_string()
}
fn default_log_level() -> String {
  "info".to_string()
}
fn default_response_rate_limit_max_attempts() -> usize {
  5
}
fn default_response_rate_limit_window_seconds() -> u64 {
  60
}

impl EngineEnv {
  pub fn load() -> anyhow::Result<Self> {
    envy::prefixed("GP_")
      .from_env::<Self>()
      .map_err(|e| anyhow::anyhow!("failed to parse GP_* env vars: {e}"))
  }

  pub fn default_provisioner_config(&self) -> ProvisionerConfig {
    let algorithm = match self.load_balancing_algorithm.as_str() {
      "least-connection" => LoadBalancingAlgorithm::LeastConnection,
      _ => LoadBalancingAlgorithm::RoundRobin,
    };
    ProvisionerConfig {
      authorized_users: split_csv(&self.authorized_users),
      unauthorized_users: split_csv(&self.unauthorized_users),
      port_range: (0, 0),
      launch_timeout_secs: self.kernel_launch_timeout,
      impersonation_enabled: self.impersonation_enabled,
      tunneling_enabled: self.enable_tunneling,
      load_balancing_algorithm: algorithm,
      prohibited_uids: self.prohibited_uids(),
      prohibited_gids: self.prohibited_gids(),
    }
  }

  pub fn remote_hosts(&self) -> Vec<String> {
    self
      .remote_hosts
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(str::to_string)
      .collect()
  }

  pub fn prohibited_uids(&self) -> HashSet<u32> {
    split_csv_numeric(&self.prohibited_uids)
  }

  pub fn prohibited_gids(&self) -> HashSet<u32> {
    split_csv_numeric(&self.prohibited_gids)
  }
}

fn split_csv_numeric(raw: &str) -> HashSet<u32> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .filter_map(|s| s.parse().ok())
    .collect()
}

fn split_csv(raw: &str) -> HashSet<String> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .collect()
}

/// CLI flags an operator would actually want to override at
/// invocation time; everything else lives in the environment.
#[derive(Parser, Debug)]
#[command(version, about = "Remote kernel provisioner engine")]
pub struct CliArgs {
  #[arg(long)]
  pub log_level: Option<String>,
  #[arg(long)]
  pub config_path: Option<String>,
}

/// Process-wide resolved settings: `GP_*` env with CLI overrides
/// layered on top, read once into this struct and never mutated.
pub struct EngineConfig {
  pub env: EngineEnv,
  pub log_level_override: Option<String>,
}

impl EngineConfig {
  pub fn load() -> anyhow::Result<Self> {
    let mut env = EngineEnv::load()?;
    let cli = CliArgs::parse();
    if let Some(level) = &cli.log_level {
      env.log_level = level.clone();
    }
    Ok(Self {
      log_level_override: cli.log_level,
      env,
    })
  }
}

static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Process-wide config accessor. Initializes from the environment on
/// first call; panics if the environment cannot be parsed, since an
/// unparseable `GP_*` var is an operator misconfiguration that should
/// fail fast at startup, not surface as a runtime error mid-launch.
pub fn engine_config() -> &'static EngineConfig {
  ENGINE_CONFIG.get_or_init(|| {
    EngineConfig::load().expect("failed to load engine configuration")
  })
}

/// Rate limiter guarding the response manager's listener against a
/// peer flooding it with malformed or unroutable payloads.
pub fn response_rate_limiter() -> &'static std::sync::Arc<rate_limit::RateLimiter> {
  static LIMITER: OnceLock<std::sync::Arc<rate_limit::RateLimiter>> =
    OnceLock::new();
  LIMITER.get_or_init(|| {
    let env = &engine_config().env;
    if env.response_rate_limit_disabled {
      tracing::warn!("response manager rate limiting is disabled");
    }
    rate_limit::RateLimiter::new(
      env.response_rate_limit_disabled,
      env.response_rate_limit_max_attempts,
      env.response_rate_limit_window_seconds,
    )
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_csv_trims_and_drops_empties() {
    let set = split_csv(" alice, bob ,,carol");
    assert_eq!(set.len(), 3);
    assert!(set.contains("alice"));
    assert!(set.contains("carol"));
  }
}
