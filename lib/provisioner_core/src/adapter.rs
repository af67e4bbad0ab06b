use std::collections::HashMap;

use async_trait::async_trait;
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};

/// Where a backend landed a kernel, as far as the engine needs to
/// know: enough to keep polling it and to tear it down later. The
/// adapter is free to pack whatever it needs into `backend_handle`
/// (a pod name, a container id, a YARN application id, an SSH pid).
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
  pub host: String,
  pub backend_handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
  Running,
  Terminated,
  Failed,
  Unknown,
}

/// The capability set every platform-specific backend must provide.
/// The supervisor only ever talks to `dyn BackendAdapter`; adding a
/// new platform never touches the state machine.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
  /// Stable identifier matched against `KernelSpec.provisioner.provisioner_name`.
  fn name(&self) -> &'static str;

  /// Starts the kernel-launcher process/resource. `argv` has already
  /// had its placeholders substituted. Returns an opaque handle the
  /// adapter will be handed back on every later call for this kernel.
  async fn spawn(
    &self,
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    config: &ProvisionerConfig,
    spec: &KernelSpec,
  ) -> Result<String, ProvisionerError>;

  /// Locates the backend resource started by `spawn` and returns its
  /// routable host. May poll internally; callers apply their own
  /// overall deadline.
  async fn discover(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError>;

  /// Cheap liveness check, safe to call roughly every 3 seconds.
  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError>;

  /// Best-effort native signal delivery outside the communication
  /// socket (used when the kernel can't be reached over TCP, e.g. a
  /// container in a CrashLoop). Not every backend can honor this.
  async fn send_native_signal(
    &self,
    kernel_id: &str,
    backend_handle: &str,
    signum: i32,
  ) -> Result<(), ProvisionerError>;

  /// Removes whatever backend resource `spawn` created. Must be safe
  /// to call on a partially-launched or already-gone resource.
  async fn terminate_backend_resources(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError>;
}
