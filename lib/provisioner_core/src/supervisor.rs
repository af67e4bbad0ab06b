use std::{sync::Arc, time::Duration};

use provisioner_client::{
  ConnectionInfo, KernelBinding, KernelSpec, KernelState,
  ProvisionerConfig, ProvisionerError, spec::substitute_placeholders,
};
use tokio::{
  io::AsyncWriteExt,
  net::TcpStream,
  sync::Mutex,
  time::timeout,
};
use tracing::{info, warn};

use crate::{
  adapter::BackendAdapter, response_manager::ResponseManager,
  tunnel::Tunneler,
};

const SIGINT: i32 = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const PORT_NAMES: [&str; 6] = [
  "SHELL_PORT",
  "IOPUB_PORT",
  "STDIN_PORT",
  "CONTROL_PORT",
  "HB_PORT",
  "COMMUNICATION_PORT",
];

/// Owns exactly one kernel's lifetime from authorization through
/// termination. The host drives it through the methods below; no two
/// state-changing calls are allowed to interleave, enforced by the
/// single internal mutex around the binding.
pub struct KernelSupervisor {
  binding: Mutex<KernelBinding>,
  adapter: Arc<dyn BackendAdapter>,
  response_manager: Arc<ResponseManager>,
  tunneler: Option<Arc<dyn Tunneler>>,
  config: ProvisionerConfig,
}

impl KernelSupervisor {
  pub fn new(
    kernel_id: impl Into<String>,
    username: impl Into<String>,
    adapter: Arc<dyn BackendAdapter>,
    response_manager: Arc<ResponseManager>,
    tunneler: Option<Arc<dyn Tunneler>>,
    config: ProvisionerConfig,
  ) -> Self {
    Self {
      binding: Mutex::new(KernelBinding::new(kernel_id, username)),
      adapter,
      response_manager,
      tunneler,
      config,
    }
  }

  pub async fn state(&self) -> KernelState {
    self.binding.lock().await.state
  }

  pub async fn connection_info(&self) -> Option<ConnectionInfo> {
    self.binding.lock().await.connection_info.clone()
  }

  /// Snapshot of everything needed to reattach to this kernel after a
  /// host restart, without relaunching it.
  pub async fn get_provisioner_info(&self) -> serde_json::Value {
    let binding = self.binding.lock().await;
    serde_json::to_value(&*binding)
      .unwrap_or(serde_json::Value::Null)
  }

  /// Restores a binding previously produced by [`Self::get_provisioner_info`].
  pub async fn load_provisioner_info(
    &self,
    info: serde_json::Value,
  ) -> Result<(), ProvisionerError> {
    let restored: KernelBinding =
      serde_json::from_value(info).map_err(|e| {
        ProvisionerError::Other(anyhow::anyhow!(
          "invalid provisioner info: {e}"
        ))
      })?;
    *self.binding.lock().await = restored;
    Ok(())
  }

  /// How long the host should wait for a graceful shutdown before
  /// escalating to [`Self::kill`]. A distributed/remote backend needs
  /// longer than the host's own default to account for SSH round-trips.
  pub fn get_shutdown_wait_time(&self, default: Duration) -> Duration {
    default.max(SHUTDOWN_GRACE)
  }

  /// Polls until the kernel is no longer running.
  pub async fn wait(&self) -> Result<(), ProvisionerError> {
    loop {
      if !self.poll().await? {
        return Ok(());
      }
      tokio::time::sleep(Duration::from_millis(200)).await;
    }
  }

  pub async fn launch(
    &self,
    spec: &KernelSpec,
  ) -> Result<(), ProvisionerError> {
    let (kernel_id, username) = {
      let binding = self.binding.lock().await;
      (binding.kernel_id.clone(), binding.username.clone())
    };

    if let Err(e) =
      self.config.check_authorized(&username, &spec.display_name)
    {
      self.transition(KernelState::Failed).await;
      return Err(e);
    }
    let uid = spec.env.get("KERNEL_UID").and_then(|v| v.parse().ok());
    let gid = spec.env.get("KERNEL_GID").and_then(|v| v.parse().ok());
    if let Err(e) = self.config.check_identity(uid, gid) {
      self.transition(KernelState::Failed).await;
      return Err(e);
    }
    self.transition(KernelState::Authorized).await;

    let result = self.launch_inner(&kernel_id, spec).await;
    if let Err(e) = &result {
      warn!(kernel_id, "launch failed: {e}");
      if let Some(handle) = self.binding.lock().await.backend_handle.clone() {
        if let Err(cleanup_err) = self
          .adapter
          .terminate_backend_resources(&kernel_id, &handle)
          .await
        {
          warn!(kernel_id, "cleanup after failed launch also failed: {cleanup_err}");
        }
      }
      if let Some(tunneler) = &self.tunneler {
        tunneler.close_tunnels(&kernel_id).await;
      }
      self.transition(KernelState::Failed).await;
    }
    result
  }

  async fn launch_inner(
    &self,
    kernel_id: &str,
    spec: &KernelSpec,
  ) -> Result<(), ProvisionerError> {
    let ports = port_allocator::allocate(6, self.config.port_range)?;
    let port_range_str = if self.config.port_range == (0, 0) {
      "0..0".to_string()
    } else {
      format!("{}..{}", self.config.port_range.0, self.config.port_range.1)
    };

    let response_address = self.response_manager.local_addr().to_string();
    let public_key = self.response_manager.public_key_base64();

    let argv = substitute_placeholders(
      &spec.argv,
      kernel_id,
      &response_address,
      public_key,
      &port_range_str,
    );

    let mut env = spec.env.clone();
    env.insert("KERNEL_ID".to_string(), kernel_id.to_string());
    for (i, name) in PORT_NAMES.iter().enumerate() {
      env.insert(format!("KERNEL_{name}"), ports[i].to_string());
    }

    let rx = self.response_manager.register(kernel_id);
    self.transition(KernelState::Launching).await;

    let backend_handle = match self
      .adapter
      .spawn(kernel_id, &argv, &env, &self.config, spec)
      .await
    {
      Ok(handle) => handle,
      Err(e) => {
        self.response_manager.unregister(kernel_id);
        return Err(e);
      }
    };
    self.binding.lock().await.backend_handle = Some(backend_handle.clone());

    self.transition(KernelState::AwaitingConnection).await;
    let deadline = Duration::from_secs(self.config.launch_timeout_secs);
    let mut conn_info = self
      .response_manager
      .await_payload(kernel_id, rx, deadline)
      .await?;

    self.transition(KernelState::Discovering).await;
    let discovered = self
      .adapter
      .discover(kernel_id, &backend_handle)
      .await?;
    conn_info.ip = discovered.host.clone();

    if self.config.tunneling_enabled {
      if let Some(tunneler) = &self.tunneler {
        let port_pairs: Vec<(u16, u16)> =
          ports.iter().map(|&p| (p, p)).collect();
        tunneler
          .open_tunnels(kernel_id, &discovered.host, &port_pairs)
          .await?;
        conn_info.ip = "127.0.0.1".to_string();
      }
    }

    {
      let mut binding = self.binding.lock().await;
      binding.assigned_host = Some(discovered.host);
      binding.connection_info = Some(conn_info);
      binding.backend_handle = Some(discovered.backend_handle);
    }
    self.transition(KernelState::Running).await;
    info!(kernel_id, "kernel is running");
    Ok(())
  }

  /// Cheap existence probe: a signum-0 message over the communication
  /// socket, falling back to the adapter's own status check if the
  /// socket can't be reached at all.
  pub async fn poll(&self) -> Result<bool, ProvisionerError> {
    let binding = self.binding.lock().await;
    if binding.state != KernelState::Running {
      return Ok(binding.state != KernelState::Terminated
        && binding.state != KernelState::Failed);
    }
    let kernel_id = binding.kernel_id.clone();
    let handle = binding.backend_handle.clone();
    let conn_info = binding.connection_info.clone();
    drop(binding);

    if let Some(conn_info) = conn_info
      && self.send_communication_message(&conn_info, r#"{"signum":0}"#).await.is_ok()
    {
      return Ok(true);
    }

    let Some(handle) = handle else {
      return Ok(false);
    };
    let status = self.adapter.status(&kernel_id, &handle).await?;
    Ok(status == crate::adapter::BackendStatus::Running)
  }

  pub async fn send_signal(
    &self,
    signum: i32,
  ) -> Result<(), ProvisionerError> {
    let binding = self.binding.lock().await;
    let Some(conn_info) = binding.connection_info.clone() else {
      return Err(ProvisionerError::Other(anyhow::anyhow!(
        "kernel has no connection info yet"
      )));
    };
    let kernel_id = binding.kernel_id.clone();
    let handle = binding.backend_handle.clone();
    drop(binding);

    let message = format!(r#"{{"signum":{signum}}}"#);
    if self
      .send_communication_message(&conn_info, &message)
      .await
      .is_err()
      && let Some(handle) = handle
    {
      self
        .adapter
        .send_native_signal(&kernel_id, &handle, signum)
        .await?;
    }
    Ok(())
  }

  pub async fn interrupt(&self) -> Result<(), ProvisionerError> {
    self.send_signal(SIGINT).await
  }

  pub async fn terminate(
    &self,
    graceful: bool,
  ) -> Result<(), ProvisionerError> {
    self.transition(KernelState::Terminating).await;

    if graceful {
      let binding = self.binding.lock().await;
      if let Some(conn_info) = binding.connection_info.clone() {
        drop(binding);
        let _ = self
          .send_communication_message(&conn_info, r#"{"shutdown":1}"#)
          .await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
      }
    }

    self.kill().await
  }

  pub async fn kill(&self) -> Result<(), ProvisionerError> {
    let (kernel_id, handle) = {
      let binding = self.binding.lock().await;
      (binding.kernel_id.clone(), binding.backend_handle.clone())
    };
    if let Some(handle) = handle {
      self
        .adapter
        .terminate_backend_resources(&kernel_id, &handle)
        .await?;
    }
    if let Some(tunneler) = &self.tunneler {
      tunneler.close_tunnels(&kernel_id).await;
    }
    self.transition(KernelState::Terminated).await;
    Ok(())
  }

  async fn send_communication_message(
    &self,
    conn_info: &ConnectionInfo,
    message: &str,
  ) -> anyhow::Result<()> {
    let addr = format!("{}:{}", conn_info.ip, conn_info.communication_port);
    let mut stream =
      timeout(Duration::from_secs(3), TcpStream::connect(&addr)).await??;
    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
  }

  async fn transition(&self, next: KernelState) {
    let mut binding = self.binding.lock().await;
    if binding.state.can_transition_to(next) {
      binding.transition(next);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{collections::HashMap, net::Ipv4Addr};

  use async_trait::async_trait;
  use provisioner_client::{config::LoadBalancingAlgorithm, KernelSpec};
  use provisioner_crypto::ProvisionerKeypair;
  use rate_limit::RateLimiter;

  use super::*;
  use crate::adapter::{BackendStatus, DiscoveredHost};

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
        host: "localhost".to_string(),
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

  struct FailingSpawnAdapter;

  #[async_trait]
  impl BackendAdapter for FailingSpawnAdapter {
    fn name(&self) -> &'static str {
      "failing-spawn"
    }
    async fn spawn(
      &self,
      _: &str,
      _: &[String],
      _: &HashMap<String, String>,
      _: &ProvisionerConfig,
      _: &KernelSpec,
    ) -> Result<String, ProvisionerError> {
      Err(ProvisionerError::BackendLaunchFailed {
        kernel_id: "k1".to_string(),
        reason: "backend unreachable".to_string(),
      })
    }
    async fn discover(
      &self,
      _: &str,
      _: &str,
    ) -> Result<DiscoveredHost, ProvisionerError> {
      unreachable!("discover is never reached once spawn fails")
    }
    async fn status(
      &self,
      _: &str,
      _: &str,
    ) -> Result<BackendStatus, ProvisionerError> {
      Ok(BackendStatus::Unknown)
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

  fn stub_spec() -> KernelSpec {
    KernelSpec {
      display_name: "stub kernel".to_string(),
      language: "python".to_string(),
      argv: vec!["launcher".to_string()],
      env: HashMap::new(),
      provisioner: provisioner_client::ProvisionerSpec {
        provisioner_name: "failing-spawn".to_string(),
        config: HashMap::new(),
      },
    }
  }

  fn stub_config() -> ProvisionerConfig {
    ProvisionerConfig {
      authorized_users: Default::default(),
      unauthorized_users: Default::default(),
      port_range: (0, 0),
      launch_timeout_secs: 5,
      impersonation_enabled: false,
      tunneling_enabled: false,
      load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
      prohibited_uids: Default::default(),
      prohibited_gids: Default::default(),
    }
  }

  async fn stub_supervisor() -> KernelSupervisor {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let response_manager = ResponseManager::bind(
      Ipv4Addr::LOCALHOST.into(),
      0,
      3,
      keypair,
      RateLimiter::new(true, 5, 60),
    )
    .await
    .unwrap();
    KernelSupervisor::new(
      "k1",
      "alice",
      Arc::new(StubAdapter),
      response_manager,
      None,
      stub_config(),
    )
  }

  #[tokio::test]
  async fn provisioner_info_round_trips_through_another_supervisor() {
    let source = stub_supervisor().await;
    source.transition(KernelState::Authorized).await;
    source.transition(KernelState::Launching).await;

    let info = source.get_provisioner_info().await;

    let target = stub_supervisor().await;
    target.load_provisioner_info(info).await.unwrap();
    assert_eq!(target.state().await, KernelState::Launching);
  }

  #[tokio::test]
  async fn shutdown_wait_time_never_undercuts_the_grace_period() {
    let supervisor = stub_supervisor().await;
    assert_eq!(
      supervisor.get_shutdown_wait_time(Duration::from_secs(1)),
      SHUTDOWN_GRACE
    );
    assert_eq!(
      supervisor.get_shutdown_wait_time(Duration::from_secs(3600)),
      Duration::from_secs(3600)
    );
  }

  #[tokio::test]
  async fn wait_returns_once_kernel_leaves_inflight_states() {
    let supervisor = stub_supervisor().await;
    supervisor.transition(KernelState::Failed).await;
    tokio::time::timeout(Duration::from_secs(1), supervisor.wait())
      .await
      .expect("wait should return promptly once terminal")
      .unwrap();
  }

  #[tokio::test]
  async fn failed_spawn_unregisters_its_waiter_so_retry_does_not_panic() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let response_manager = ResponseManager::bind(
      Ipv4Addr::LOCALHOST.into(),
      0,
      3,
      keypair,
      RateLimiter::new(true, 5, 60),
    )
    .await
    .unwrap();
    let supervisor = KernelSupervisor::new(
      "k1",
      "alice",
      Arc::new(FailingSpawnAdapter),
      response_manager,
      None,
      stub_config(),
    );

    assert!(supervisor.launch(&stub_spec()).await.is_err());
    assert_eq!(supervisor.state().await, KernelState::Failed);

    // A second register() for the same kernel_id would panic on a
    // still-registered waiter from the failed attempt above.
    supervisor.response_manager.register("k1");
  }
}

