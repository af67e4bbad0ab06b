use std::collections::HashMap;

use async_trait::async_trait;
use kube::{
  Api, Client, ResourceExt,
  api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ObjectMeta, PostParams},
};
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};
use provisioner_core::adapter::{
  BackendAdapter, BackendStatus, DiscoveredHost,
};
use serde_json::json;

/// Same launch/discover/terminate protocol as [`crate::KubernetesAdapter`]
/// but submits a `SparkApplication` custom resource instead of a bare
/// pod, for clusters running the Spark Operator.
pub struct SparkApplicationAdapter {
  client: Client,
  namespace: String,
}

impl SparkApplicationAdapter {
  pub fn new(client: Client, namespace: String) -> Self {
    Self { client, namespace }
  }

  fn resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
      group: "sparkoperator.k8s.io".to_string(),
      version: "v1beta2".to_string(),
      kind: "SparkApplication".to_string(),
    })
  }
}

#[async_trait]
impl BackendAdapter for SparkApplicationAdapter {
  fn name(&self) -> &'static str {
    "kubernetes-spark-operator"
  }

  async fn spawn(
    &self,
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    _config: &ProvisionerConfig,
    spec: &KernelSpec,
  ) -> Result<String, ProvisionerError> {
    let image = spec
      .provisioner
      .config
      .get("image_name")
      .and_then(|v| v.as_str())
      .ok_or_else(|| ProvisionerError::BackendLaunchFailed {
        kernel_id: kernel_id.to_string(),
        reason: "provisioner.config.image_name is required".to_string(),
      })?
      .to_string();

    let name = format!("kernel-{kernel_id}");
    let api_resource = Self::resource();
    let mut meta = ObjectMeta::default();
    meta.name = Some(name.clone());
    meta.labels = Some(
      [("kernel_id".to_string(), kernel_id.to_string())]
        .into_iter()
        .collect(),
    );

    let mut object = DynamicObject::new(&name, &api_resource);
    object.metadata = meta;
    object.data = json!({
      "spec": {
        "type": "Python",
        "mode": "cluster",
        "image": image,
        "mainApplicationFile": argv.first().cloned().unwrap_or_default(),
        "arguments": argv.iter().skip(1).collect::<Vec<_>>(),
        "sparkConf": env,
      }
    });

    let api: Api<DynamicObject> =
      Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource);
    api.create(&PostParams::default(), &object).await.map_err(|e| {
      ProvisionerError::BackendLaunchFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }
    })?;

    Ok(name)
  }

  async fn discover(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError> {
    let api_resource = Self::resource();
    let api: Api<DynamicObject> =
      Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource);
    let obj = api.get(backend_handle).await.map_err(|e| {
      ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }
    })?;
    let host = obj
      .data
      .get("status")
      .and_then(|s| s.get("driverInfo"))
      .and_then(|d| d.get("podName"))
      .and_then(|n| n.as_str())
      .map(str::to_string)
      .unwrap_or_else(|| obj.name_any());
    Ok(DiscoveredHost { host, backend_handle: backend_handle.to_string() })
  }

  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError> {
    let api_resource = Self::resource();
    let api: Api<DynamicObject> =
      Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource);
    match api.get(backend_handle).await {
      Ok(obj) => {
        let state = obj
          .data
          .get("status")
          .and_then(|s| s.get("applicationState"))
          .and_then(|s| s.get("state"))
          .and_then(|s| s.as_str())
          .unwrap_or("");
        Ok(match state {
          "RUNNING" | "SUBMITTED" => BackendStatus::Running,
          "COMPLETED" => BackendStatus::Terminated,
          "FAILED" => BackendStatus::Failed,
          _ => BackendStatus::Unknown,
        })
      }
      Err(kube::Error::Api(e)) if e.code == 404 => {
        Ok(BackendStatus::Terminated)
      }
      Err(e) => Err(ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }),
    }
  }

  async fn send_native_signal(
    &self,
    _kernel_id: &str,
    _backend_handle: &str,
    _signum: i32,
  ) -> Result<(), ProvisionerError> {
    Ok(())
  }

  async fn terminate_backend_resources(
    &self,
    _kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError> {
    let api_resource = Self::resource();
    let api: Api<DynamicObject> =
      Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource);
    let _ = api.delete(backend_handle, &DeleteParams::default()).await;
    Ok(())
  }
}
