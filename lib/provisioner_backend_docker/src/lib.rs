use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
  Docker,
  container::{
    Config as ContainerConfig, KillContainerOptions, RemoveContainerOptions,
  },
  secret::{RestartPolicy, RestartPolicyNameEnum},
  service::{
    ContainerSpec, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec,
  },
};
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};
use provisioner_core::adapter::{
  BackendAdapter, BackendStatus, DiscoveredHost,
};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerMode {
  Container,
  Swarm,
}

/// Launches each kernel as a Docker container or a Swarm service
/// (one-shot, `restart: none`), depending on [`DockerMode`]. Both
/// modes name the resource `{username}-{kernel_id}` and label it with
/// `kernel_id` so it can be found again without keeping local state.
pub struct DockerAdapter {
  docker: Docker,
  mode: DockerMode,
  network: Option<String>,
}

impl DockerAdapter {
  pub fn new(
    docker: Docker,
    mode: DockerMode,
    network: Option<String>,
  ) -> Self {
    Self { docker, mode, network }
  }

  fn resource_name(username: &str, kernel_id: &str) -> String {
    format!("{username}-{kernel_id}")
  }

  fn labels(kernel_id: &str) -> HashMap<String, String> {
    HashMap::from([
      ("kernel_id".to_string(), kernel_id.to_string()),
      ("component".to_string(), "kernel".to_string()),
      ("app".to_string(), "gateway-provisioner".to_string()),
    ])
  }

  fn image(
    &self,
    spec: &KernelSpec,
  ) -> Result<String, ProvisionerError> {
    spec
      .provisioner
      .config
      .get("image_name")
      .and_then(|v| v.as_str())
      .map(str::to_string)
      .ok_or_else(|| {
        ProvisionerError::BackendLaunchFailed {
          kernel_id: spec.display_name.clone(),
          reason: "provisioner.config.image_name is required".to_string(),
        }
      })
  }
}

#[async_trait]
impl BackendAdapter for DockerAdapter {
  fn name(&self) -> &'static str {
    match self.mode {
      DockerMode::Container => "docker",
      DockerMode::Swarm => "docker-swarm",
    }
  }

  #[instrument(skip(self, argv, env, _config, spec))]
  async fn spawn(
    &self,
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    _config: &ProvisionerConfig,
    spec: &KernelSpec,
  ) -> Result<String, ProvisionerError> {
    let username = env
      .get("KERNEL_USERNAME")
      .cloned()
      .unwrap_or_else(|| "anonymous".to_string());
    let name = Self::resource_name(&username, kernel_id);
    let image = self.image(spec)?;
    let env_vec: Vec<String> =
      env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    match self.mode {
      DockerMode::Container => {
        let config = ContainerConfig {
          image: Some(image),
          cmd: Some(argv.to_vec()),
          env: Some(env_vec),
          labels: Some(Self::labels(kernel_id)),
          ..Default::default()
        };
        let options = bollard::container::CreateContainerOptions {
          name: name.clone(),
          platform: None,
        };
        self
          .docker
          .create_container(Some(options), config)
          .await
          .map_err(|e| ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        self
          .docker
          .start_container::<String>(&name, None)
          .await
          .map_err(|e| ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        Ok(name)
      }
      DockerMode::Swarm => {
        let spec_body = ServiceSpec {
          name: Some(name.clone()),
          labels: Some(Self::labels(kernel_id)),
          task_template: Some(TaskSpec {
            container_spec: Some(ContainerSpec {
              image: Some(image),
              command: Some(argv.to_vec()),
              env: Some(env_vec),
              ..Default::default()
            }),
            restart_policy: Some(RestartPolicy {
              name: Some(RestartPolicyNameEnum::NONE),
              ..Default::default()
            }),
            networks: self.network.as_ref().map(|n| {
              vec![bollard::secret::NetworkAttachmentConfig {
                target: Some(n.clone()),
                ..Default::default()
              }]
            }),
            ..Default::default()
          }),
          mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
              replicas: Some(1),
            }),
            ..Default::default()
          }),
          ..Default::default()
        };
        let response = self
          .docker
          .create_service(spec_body, None)
          .await
          .map_err(|e| ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        Ok(response.id.unwrap_or(name))
      }
    }
  }

  async fn discover(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError> {
    match self.mode {
      DockerMode::Container => {
        let inspect = self
          .docker
          .inspect_container(backend_handle, None)
          .await
          .map_err(|e| ProvisionerError::BackendDiscoveryFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        let ip = inspect
          .network_settings
          .and_then(|n| n.networks)
          .and_then(|nets| nets.into_values().next())
          .and_then(|net| net.ip_address)
          .filter(|ip| !ip.is_empty())
          .unwrap_or_else(|| backend_handle.to_string());
        Ok(DiscoveredHost {
          host: ip,
          backend_handle: backend_handle.to_string(),
        })
      }
      DockerMode::Swarm => {
        // Swarm's embedded DNS resolves the service name to its
        // virtual IP cluster-wide, so the service name is itself a
        // routable host.
        Ok(DiscoveredHost {
          host: backend_handle.to_string(),
          backend_handle: backend_handle.to_string(),
        })
      }
    }
  }

  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError> {
    match self.mode {
      DockerMode::Container => {
        let inspect = self
          .docker
          .inspect_container(backend_handle, None)
          .await
          .map_err(|e| ProvisionerError::BackendDiscoveryFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        let state = inspect.state.and_then(|s| s.status);
        Ok(match state {
          Some(bollard::secret::ContainerStateStatusEnum::RUNNING) => {
            BackendStatus::Running
          }
          Some(bollard::secret::ContainerStateStatusEnum::EXITED) => {
            BackendStatus::Terminated
          }
          Some(bollard::secret::ContainerStateStatusEnum::DEAD) => {
            BackendStatus::Failed
          }
          _ => BackendStatus::Unknown,
        })
      }
      DockerMode::Swarm => {
        match self.docker.inspect_service(backend_handle, None).await {
          Ok(_) => Ok(BackendStatus::Running),
          Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
          }) => Ok(BackendStatus::Terminated),
          Err(e) => Err(ProvisionerError::BackendDiscoveryFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          }),
        }
      }
    }
  }

  async fn send_native_signal(
    &self,
    kernel_id: &str,
    backend_handle: &str,
    signum: i32,
  ) -> Result<(), ProvisionerError> {
    if self.mode == DockerMode::Swarm {
      // Swarm has no per-task signal API; the communication socket
      // is the only channel.
      return Ok(());
    }
    self
      .docker
      .kill_container(
        backend_handle,
        Some(KillContainerOptions { signal: format!("{signum}") }),
      )
      .await
      .map_err(|e| ProvisionerError::Other(anyhow::anyhow!(
        "failed to signal kernel '{kernel_id}': {e}"
      )))
  }

  async fn terminate_backend_resources(
    &self,
    _kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError> {
    match self.mode {
      DockerMode::Container => {
        let _ = self
          .docker
          .remove_container(
            backend_handle,
            Some(RemoveContainerOptions {
              force: true,
              ..Default::default()
            }),
          )
          .await;
      }
      DockerMode::Swarm => {
        let _ = self.docker.delete_service(backend_handle).await;
      }
    }
    Ok(())
  }
}
