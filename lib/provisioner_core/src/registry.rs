use std::{collections::HashMap, sync::Arc};

use provisioner_client::{ProvisionerConfig, ProvisionerError};

use crate::adapter::BackendAdapter;

/// Resolves a kernel spec's `provisioner_name` to the backend that
/// implements it, and applies the per-kernel config overlay over the
/// process-wide policy. Populated once at process start; adapters
/// never change after that.
#[derive(Default)]
pub struct ProvisionerRegistry {
  adapters: HashMap<&'static str, Arc<dyn BackendAdapter>>,
}

impl ProvisionerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
    self.adapters.insert(adapter.name(), adapter);
  }

  pub fn resolve(
    &self,
    provisioner_name: &str,
  ) -> Result<Arc<dyn BackendAdapter>, ProvisionerError> {
    self.adapters.get(provisioner_name).cloned().ok_or_else(|| {
      ProvisionerError::Other(anyhow::anyhow!(
        "no backend registered for provisioner '{provisioner_name}'"
      ))
    })
  }

  pub fn registered_names(&self) -> Vec<&'static str> {
    self.adapters.keys().copied().collect()
  }
}

/// Merges the per-kernel `provisioner.config` stanza over the
/// process-wide default, per the override/amend rule documented on
/// [`ProvisionerConfig::merge`].
pub fn resolve_config(
  defaults: &ProvisionerConfig,
  overlay_json: &HashMap<String, serde_json::Value>,
) -> Result<ProvisionerConfig, ProvisionerError> {
  let overlay: provisioner_client::config::PartialProvisionerConfig =
    serde_json::from_value(serde_json::Value::Object(
      overlay_json.clone().into_iter().collect(),
    ))
    .map_err(|e| {
      ProvisionerError::Other(anyhow::anyhow!(
        "invalid per-kernel provisioner config: {e}"
      ))
    })?;
  Ok(defaults.merge(&overlay))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::adapter::{BackendStatus, DiscoveredHost};
  use async_trait::async_trait;
  use provisioner_client::KernelSpec;

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

  #[test]
  fn resolves_registered_adapter_by_name() {
    let mut registry = ProvisionerRegistry::new();
    registry.register(Arc::new(StubAdapter));
    assert!(registry.resolve("stub").is_ok());
    assert!(registry.resolve("missing").is_err());
  }
}
