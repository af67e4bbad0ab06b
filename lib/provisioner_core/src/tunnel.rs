use async_trait::async_trait;
use provisioner_client::ProvisionerError;

/// Optional port-forwarding seam, symmetric with [`crate::adapter::BackendAdapter`]:
/// the supervisor depends only on this trait, never on a concrete
/// transport, so tunneling can be swapped or omitted per deployment.
#[async_trait]
pub trait Tunneler: Send + Sync {
  /// Opens one local forward per `(local_port, remote_port)` pair onto
  /// `host`, keyed by `kernel_id` for later teardown.
  async fn open_tunnels(
    &self,
    kernel_id: &str,
    host: &str,
    ports: &[(u16, u16)],
  ) -> Result<(), ProvisionerError>;

  /// Tears down every tunnel opened for `kernel_id`. Safe to call even
  /// if none were ever opened.
  async fn close_tunnels(&self, kernel_id: &str);
}
