use std::{collections::HashMap, sync::Arc};

use backend_distributed::{DistributedAdapter, HostPool, SshTunneler};
use backend_docker::{DockerAdapter, DockerMode};
use backend_k8s::{KubernetesAdapter, NamespaceMode, SparkApplicationAdapter};
use backend_yarn::YarnAdapter;
use bollard::Docker;
use provisioner_client::{KernelSpec, ProvisionerError};
use provisioner_core::{
  EngineConfig, KernelSupervisor, ProvisionerRegistry, ResponseManager,
  resolve_config, tunnel::Tunneler,
};
use tracing::{info, warn};

/// Registers every backend the running environment can actually reach.
/// Each adapter is independently best-effort: a Kubernetes cluster or
/// Docker daemon that can't be reached at startup just means that
/// provisioner name stays unregistered, not a fatal boot error.
pub async fn build_registry(
  config: &EngineConfig,
) -> ProvisionerRegistry {
  let mut registry = ProvisionerRegistry::new();
  let env = &config.env;

  match Docker::connect_with_local_defaults() {
    Ok(docker) => {
      registry.register(Arc::new(DockerAdapter::new(
        docker.clone(),
        DockerMode::Container,
        env.docker_network.clone(),
      )));
      registry.register(Arc::new(DockerAdapter::new(
        docker,
        DockerMode::Swarm,
        env.docker_network.clone(),
      )));
      info!("registered docker and docker-swarm backends");
    }
    Err(e) => warn!("docker backend unavailable: {e}"),
  }

  match kube::Client::try_default().await {
    Ok(client) => {
      let namespace_mode = match (&env.namespace, env.shared_namespace) {
        (Some(ns), true) => NamespaceMode::Shared(ns.clone()),
        (Some(ns), false) if env.kernel_cluster_role.is_none() => {
          NamespaceMode::Shared(ns.clone())
        }
        _ => match &env.kernel_cluster_role {
          Some(role) => NamespaceMode::Automatic { cluster_role: role.clone() },
          None => NamespaceMode::BringYourOwn,
        },
      };
      registry.register(Arc::new(KubernetesAdapter::new(
        client.clone(),
        namespace_mode,
      )));
      registry.register(Arc::new(SparkApplicationAdapter::new(
        client,
        env.namespace.clone().unwrap_or_else(|| "default".to_string()),
      )));
      info!("registered kubernetes and kubernetes-spark-operator backends");
    }
    Err(e) => warn!("kubernetes backend unavailable: {e}"),
  }

  if let Some(endpoint) = &env.yarn_endpoint {
    registry.register(Arc::new(YarnAdapter::new(
      endpoint.clone(),
      env.alt_yarn_endpoint.clone(),
    )));
    info!(endpoint, "registered yarn backend");
  }

  let hosts = env.remote_hosts();
  if !hosts.is_empty() {
    let pool = Arc::new(HostPool::new(
      hosts,
      env.default_provisioner_config().load_balancing_algorithm,
    ));
    registry.register(Arc::new(DistributedAdapter::new(
      pool,
      env.ssh_port,
      env.remote_user.clone(),
      env.impersonation_enabled,
    )));
    info!("registered distributed (SSH) backend");
  }

  registry
}

/// Builds the SSH port-forwarding tunneler when the operator has opted
/// into tunneling and configured at least one remote host; otherwise
/// every [`provisioner_core::supervisor::KernelSupervisor`] is built
/// with `tunneler: None` and connects to kernels directly.
pub fn build_tunneler(config: &EngineConfig) -> Option<Arc<dyn Tunneler>> {
  let env = &config.env;
  if !env.enable_tunneling || env.remote_hosts().is_empty() {
    return None;
  }
  let known_hosts = load_known_hosts();
  if known_hosts.is_empty() {
    warn!(
      "tunneling is enabled but no known_hosts entries were loaded; \
       every tunnel attempt will be refused"
    );
  }
  Some(Arc::new(SshTunneler::new(
    known_hosts,
    env.ssh_port,
    env.remote_user.clone().unwrap_or_default(),
    env.remote_pwd.clone(),
  )))
}

/// Resolves a kernel spec to its backend and merged policy, then
/// builds the [`KernelSupervisor`] that will own that kernel's
/// lifetime. The process-wide tunneler only reaches the supervisor
/// when the merged config actually has tunneling turned on; a
/// per-kernel override can still opt a kernel out of it.
pub fn build_supervisor(
  kernel_id: impl Into<String>,
  username: impl Into<String>,
  spec: &KernelSpec,
  config: &EngineConfig,
  registry: &ProvisionerRegistry,
  response_manager: Arc<ResponseManager>,
  tunneler: Option<Arc<dyn Tunneler>>,
) -> Result<KernelSupervisor, ProvisionerError> {
  let adapter = registry.resolve(&spec.provisioner.provisioner_name)?;
  let defaults = config.env.default_provisioner_config();
  let resolved = resolve_config(&defaults, &spec.provisioner.config)?;
  let tunneler = if resolved.tunneling_enabled { tunneler } else { None };
  Ok(KernelSupervisor::new(
    kernel_id,
    username,
    adapter,
    response_manager,
    tunneler,
    resolved,
  ))
}

/// Parses `~/.ssh/known_hosts` into the allowlist `SshTunneler` checks
/// server keys against. A host with no entry there is simply never
/// trusted; there is no prompt-and-accept fallback.
fn load_known_hosts() -> HashMap<String, russh_keys::key::PublicKey> {
  let mut hosts = HashMap::new();
  let Ok(home) = std::env::var("HOME") else {
    return hosts;
  };
  let Ok(contents) =
    std::fs::read_to_string(format!("{home}/.ssh/known_hosts"))
  else {
    return hosts;
  };
  for line in contents.lines() {
    let mut fields = line.split_whitespace();
    let (Some(host_field), Some(_key_type), Some(key_b64)) =
      (fields.next(), fields.next(), fields.next())
    else {
      continue;
    };
    let Ok(key) = russh_keys::parse_public_key_base64(key_b64) else {
      continue;
    };
    for host in host_field.split(',') {
      hosts.insert(host.to_string(), key.clone());
    }
  }
  hosts
}

#[cfg(test)]
mod tests {
  use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, Ordering},
  };

  use async_trait::async_trait;
  use provisioner_client::{ProvisionerConfig, ProvisionerSpec};
  use provisioner_core::{
    EngineEnv,
    adapter::{BackendAdapter, BackendStatus, DiscoveredHost},
  };
  use provisioner_crypto::ProvisionerKeypair;
  use rate_limit::RateLimiter;

  use super::*;

  struct StubAdapter;

  #[async_trait]
  impl BackendAdapter for StubAdapter {
    fn name(&self) -> &'static str {
      "stub"
    }
    async fn spawn(
      &self,
      _: &str,
      _: &[String],
      _: &HashMap<String, String>,
      _: &ProvisionerConfig,
      _: &KernelSpec,
    ) -> Result<String, ProvisionerError> {
      Ok("handle".to_string())
    }
    async fn discover(
      &self,
      _: &str,
      _: &str,
    ) -> Result<DiscoveredHost, ProvisionerError> {
      Ok(DiscoveredHost {
        host: "127.0.0.1".to_string(),
        backend_handle: "handle".to_string(),
      })
    }
    async fn status(
      &self,
      _: &str,
      _: &str,
    ) -> Result<BackendStatus, ProvisionerError> {
      Ok(BackendStatus::Running)
    }
    async fn send_native_signal(
      &self,
      _: &str,
      _: &str,
      _: i32,
    ) -> Result<(), ProvisionerError> {
      Ok(())
    }
    async fn terminate_backend_resources(
      &self,
      _: &str,
      _: &str,
    ) -> Result<(), ProvisionerError> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct StubTunneler {
    closed: AtomicBool,
  }

  #[async_trait]
  impl Tunneler for StubTunneler {
    async fn open_tunnels(
      &self,
      _kernel_id: &str,
      _host: &str,
      _ports: &[(u16, u16)],
    ) -> Result<(), ProvisionerError> {
      Ok(())
    }
    async fn close_tunnels(&self, _kernel_id: &str) {
      self.closed.store(true, Ordering::SeqCst);
    }
  }

  fn stub_engine_config() -> EngineConfig {
    EngineConfig {
      log_level_override: None,
      env: EngineEnv {
        response_ip: "0.0.0.0".to_string(),
        response_port: 0,
        response_port_retries: 0,
        prohibited_local_ips: String::new(),
        kernel_launch_timeout: 5,
        min_port_range_size: port_allocator::GP_MIN_PORT_RANGE_SIZE,
        max_port_range_retries: port_allocator::GP_MAX_PORT_RANGE_RETRIES,
        enable_tunneling: false,
        impersonation_enabled: false,
        load_balancing_algorithm: "round-robin".to_string(),
        remote_hosts: String::new(),
        ssh_port: 22,
        remote_user: None,
        remote_pwd: None,
        remote_gss_ssh: false,
        namespace: None,
        shared_namespace: false,
        kernel_cluster_role: None,
        prohibited_uids: String::new(),
        prohibited_gids: String::new(),
        mirror_working_dirs: false,
        yarn_endpoint: None,
        alt_yarn_endpoint: None,
        yarn_endpoint_security_enabled: false,
        docker_network: None,
        authorized_users: String::new(),
        unauthorized_users: String::new(),
        log_level: "info".to_string(),
        log_json: false,
        response_rate_limit_disabled: true,
        response_rate_limit_max_attempts: 5,
        response_rate_limit_window_seconds: 60,
      },
    }
  }

  fn stub_spec(tunneling_enabled: bool) -> KernelSpec {
    KernelSpec {
      display_name: "stub kernel".to_string(),
      language: "python".to_string(),
      argv: vec!["launcher".to_string()],
      env: HashMap::new(),
      provisioner: ProvisionerSpec {
        provisioner_name: "stub".to_string(),
        config: HashMap::from([(
          "tunneling_enabled".to_string(),
          serde_json::Value::Bool(tunneling_enabled),
        )]),
      },
    }
  }

  async fn stub_response_manager() -> Arc<ResponseManager> {
    let keypair = ProvisionerKeypair::generate().unwrap();
    ResponseManager::bind(
      Ipv4Addr::LOCALHOST.into(),
      0,
      3,
      keypair,
      RateLimiter::new(true, 5, 60),
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn enabled_tunneling_reaches_the_built_supervisor() {
    let config = stub_engine_config();
    let mut registry = ProvisionerRegistry::new();
    registry.register(Arc::new(StubAdapter));
    let tunneler = Arc::new(StubTunneler::default());

    let supervisor = build_supervisor(
      "k1",
      "alice",
      &stub_spec(true),
      &config,
      &registry,
      stub_response_manager().await,
      Some(tunneler.clone() as Arc<dyn Tunneler>),
    )
    .unwrap();

    supervisor.kill().await.unwrap();
    assert!(tunneler.closed.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn disabled_tunneling_never_reaches_the_built_supervisor() {
    let config = stub_engine_config();
    let mut registry = ProvisionerRegistry::new();
    registry.register(Arc::new(StubAdapter));
    let tunneler = Arc::new(StubTunneler::default());

    let supervisor = build_supervisor(
      "k1",
      "alice",
      &stub_spec(false),
      &config,
      &registry,
      stub_response_manager().await,
      Some(tunneler.clone() as Arc<dyn Tunneler>),
    )
    .unwrap();

    supervisor.kill().await.unwrap();
    assert!(!tunneler.closed.load(Ordering::SeqCst));
  }
}
