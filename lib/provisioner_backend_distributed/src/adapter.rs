use std::{collections::HashMap, process::Stdio, sync::Arc};

use async_trait::async_trait;
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};
use provisioner_core::adapter::{
  BackendAdapter, BackendStatus, DiscoveredHost,
};
use tokio::process::Command;
use tracing::{instrument, warn};

use crate::load_balancer::HostPool;

const PID_FILE_DIR: &str = "/tmp";

/// Launches kernels over SSH onto one of [`HostPool`]'s hosts.
/// Impersonation wraps the remote command in `sudo -u {username}`;
/// the remote PID is captured into a marker file so `status` and
/// `send_native_signal` can reach the process without depending on
/// anything the launcher itself reports back.
pub struct DistributedAdapter {
  pool: Arc<HostPool>,
  ssh_port: u16,
  ssh_user: Option<String>,
  impersonation_enabled: bool,
}

impl DistributedAdapter {
  pub fn new(
    pool: Arc<HostPool>,
    ssh_port: u16,
    ssh_user: Option<String>,
    impersonation_enabled: bool,
  ) -> Self {
    Self { pool, ssh_port, ssh_user, impersonation_enabled }
  }

  fn pid_file(kernel_id: &str) -> String {
    format!("{PID_FILE_DIR}/gpk-{kernel_id}.pid")
  }

  fn ssh_target(&self, host: &str) -> String {
    match &self.ssh_user {
      Some(user) => format!("{user}@{host}"),
      None => host.to_string(),
    }
  }

  async fn ssh_exec_capture(
    &self,
    host: &str,
    remote_command: &str,
  ) -> anyhow::Result<std::process::Output> {
    let target = self.ssh_target(host);
    let output = Command::new("ssh")
      .args(["-p", &self.ssh_port.to_string(), "-o", "BatchMode=yes", &target, remote_command])
      .stdin(Stdio::null())
      .output()
      .await?;
    Ok(output)
  }
}

#[async_trait]
impl BackendAdapter for DistributedAdapter {
  fn name(&self) -> &'static str {
    "distributed"
  }

  #[instrument(skip(self, argv, env, config, _spec))]
  async fn spawn(
    &self,
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    config: &ProvisionerConfig,
    _spec: &KernelSpec,
  ) -> Result<String, ProvisionerError> {
    let pin = env.get("KERNEL_REMOTE_HOST").map(String::as_str);
    let index = self.pool.select(pin)?;
    let host = self.pool.host(index).to_string();

    let username = env
      .get("KERNEL_USERNAME")
      .cloned()
      .unwrap_or_else(|| "anonymous".to_string());

    let env_prefix = env
      .iter()
      .map(|(k, v)| format!("{k}={}", shell_escape::escape(v.into())))
      .collect::<Vec<_>>()
      .join(" ");
    let quoted_argv = argv
      .iter()
      .map(|a| shell_escape::escape(a.into()).to_string())
      .collect::<Vec<_>>()
      .join(" ");

    let pid_file = Self::pid_file(kernel_id);
    let mut remote_command = format!(
      "{env_prefix} sh -c 'echo $$ > {pid_file}; exec {quoted_argv}'"
    );
    if self.impersonation_enabled && config.impersonation_enabled {
      remote_command = format!(
        "sudo -u {} {}",
        shell_escape::escape((&username).into()),
        remote_command
      );
    }

    let target = self.ssh_target(&host);
    let result = Command::new("ssh")
      .args([
        "-p",
        &self.ssh_port.to_string(),
        "-o",
        "BatchMode=yes",
        &target,
        &remote_command,
      ])
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(false)
      .spawn();

    match result {
      Ok(_child) => Ok(format!("{host}|{pid_file}")),
      Err(e) => {
        self.pool.release(index);
        Err(ProvisionerError::BackendLaunchFailed {
          kernel_id: kernel_id.to_string(),
          reason: format!("failed to spawn ssh to {host}: {e}"),
        })
      }
    }
  }

  async fn discover(
    &self,
    _kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError> {
    let host = backend_handle
      .split('|')
      .next()
      .unwrap_or_default()
      .to_string();
    Ok(DiscoveredHost { host, backend_handle: backend_handle.to_string() })
  }

  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError> {
    let (host, pid_file) = split_handle(backend_handle);
    let cmd = format!("kill -0 $(cat {pid_file}) 2>/dev/null");
    match self.ssh_exec_capture(&host, &cmd).await {
      Ok(output) if output.status.success() => Ok(BackendStatus::Running),
      Ok(_) => Ok(BackendStatus::Terminated),
      Err(e) => Err(ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }),
    }
  }

  async fn send_native_signal(
    &self,
    kernel_id: &str,
    backend_handle: &str,
    signum: i32,
  ) -> Result<(), ProvisionerError> {
    let (host, pid_file) = split_handle(backend_handle);
    let cmd = format!("kill -{signum} $(cat {pid_file}) 2>/dev/null");
    self.ssh_exec_capture(&host, &cmd).await.map_err(|e| {
      ProvisionerError::Other(anyhow::anyhow!(
        "failed to signal kernel '{kernel_id}' on {host}: {e}"
      ))
    })?;
    Ok(())
  }

  async fn terminate_backend_resources(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError> {
    let (host, pid_file) = split_handle(backend_handle);
    let cmd = format!("kill -9 $(cat {pid_file}) 2>/dev/null; rm -f {pid_file}");
    if let Err(e) = self.ssh_exec_capture(&host, &cmd).await {
      warn!(kernel_id, "failed to clean up remote kernel on {host}: {e}");
    }
    if let Some(index) = self.pool.index_of(&host) {
      self.pool.release(index);
    }
    Ok(())
  }
}

fn split_handle(backend_handle: &str) -> (String, String) {
  let mut parts = backend_handle.splitn(2, '|');
  let host = parts.next().unwrap_or_default().to_string();
  let pid_file = parts.next().unwrap_or_default().to_string();
  (host, pid_file)
}
