use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
  Container, EnvVar, Namespace, Pod, PodSpec,
};
use kube::{
  Api, Client, ResourceExt,
  api::{DeleteParams, ObjectMeta, PostParams},
};
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};
use provisioner_core::adapter::{
  BackendAdapter, BackendStatus, DiscoveredHost,
};
use tracing::{instrument, warn};

mod spark;
pub use spark::SparkApplicationAdapter;

#[derive(Debug, Clone)]
pub enum NamespaceMode {
  /// Launch into the same namespace the engine itself runs in.
  Shared(String),
  /// The spec's `KERNEL_NAMESPACE` env picks the namespace; it must
  /// already exist with the right RBAC bound to it.
  BringYourOwn,
  /// Create `{username}-{kernel_id}` per kernel and bind
  /// `cluster_role` to its default service account, deleting the
  /// namespace on terminate.
  Automatic { cluster_role: String },
}

/// Launches one pod per kernel, labeled `kernel_id={id}` so it can be
/// found without the engine keeping any local bookkeeping.
pub struct KubernetesAdapter {
  client: Client,
  namespace_mode: NamespaceMode,
}

const LABEL_KERNEL_ID: &str = "kernel_id";

impl KubernetesAdapter {
  pub fn new(client: Client, namespace_mode: NamespaceMode) -> Self {
    Self { client, namespace_mode }
  }

  fn labels(kernel_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
      (LABEL_KERNEL_ID.to_string(), kernel_id.to_string()),
      ("component".to_string(), "kernel".to_string()),
    ])
  }

  async fn resolve_namespace(
    &self,
    kernel_id: &str,
    username: &str,
    env: &HashMap<String, String>,
  ) -> Result<(String, bool), ProvisionerError> {
    match &self.namespace_mode {
      NamespaceMode::Shared(ns) => Ok((ns.clone(), false)),
      NamespaceMode::BringYourOwn => {
        let ns = env.get("KERNEL_NAMESPACE").cloned().ok_or_else(|| {
          ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: "KERNEL_NAMESPACE is required in bring-your-own namespace mode".to_string(),
          }
        })?;
        Ok((ns, false))
      }
      NamespaceMode::Automatic { cluster_role } => {
        let ns = format!("{username}-{kernel_id}");
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let mut meta = ObjectMeta::default();
        meta.name = Some(ns.clone());
        namespaces
          .create(
            &PostParams::default(),
            &Namespace { metadata: meta, ..Default::default() },
          )
          .await
          .map_err(|e| ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: format!("failed to create namespace {ns}: {e}"),
          })?;
        bind_cluster_role(&self.client, &ns, cluster_role)
          .await
          .map_err(|e| ProvisionerError::BackendLaunchFailed {
            kernel_id: kernel_id.to_string(),
            reason: e.to_string(),
          })?;
        Ok((ns, true))
      }
    }
  }
}

async fn bind_cluster_role(
  client: &Client,
  namespace: &str,
  cluster_role: &str,
) -> anyhow::Result<()> {
  use k8s_openapi::api::rbac::v1::{
    RoleBinding, RoleRef, Subject,
  };
  let bindings: Api<RoleBinding> =
    Api::namespaced(client.clone(), namespace);
  let mut meta = ObjectMeta::default();
  meta.name = Some(format!("{namespace}-kernel-binding"));
  let binding = RoleBinding {
    metadata: meta,
    role_ref: RoleRef {
      api_group: "rbac.authorization.k8s.io".to_string(),
      kind: "ClusterRole".to_string(),
      name: cluster_role.to_string(),
    },
    subjects: Some(vec![Subject {
      kind: "ServiceAccount".to_string(),
      name: "default".to_string(),
      namespace: Some(namespace.to_string()),
      ..Default::default()
    }]),
  };
  bindings.create(&PostParams::default(), &binding).await?;
  Ok(())
}

fn encode_handle(namespace: &str, name: &str, auto_ns: bool) -> String {
  format!("{namespace}/{name}/{}", if auto_ns { "auto" } else { "fixed" })
}

fn decode_handle(handle: &str) -> (String, String, bool) {
  let mut parts = handle.splitn(3, '/');
  let ns = parts.next().unwrap_or_default().to_string();
  let name = parts.next().unwrap_or_default().to_string();
  let auto = parts.next() == Some("auto");
  (ns, name, auto)
}

#[async_trait]
impl BackendAdapter for KubernetesAdapter {
  fn name(&self) -> &'static str {
    "kubernetes"
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
    let (namespace, auto_ns) =
      self.resolve_namespace(kernel_id, &username, env).await?;

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

    let env_vars: Vec<EnvVar> = env
      .iter()
      .map(|(k, v)| EnvVar {
        name: k.clone(),
        value: Some(v.clone()),
        ..Default::default()
      })
      .collect();

    let pod_name = format!("kernel-{kernel_id}");
    let mut meta = ObjectMeta::default();
    meta.name = Some(pod_name.clone());
    meta.labels = Some(Self::labels(kernel_id));

    let pod = Pod {
      metadata: meta,
      spec: Some(PodSpec {
        containers: vec![Container {
          name: "kernel".to_string(),
          image: Some(image),
          command: Some(argv.to_vec()),
          env: Some(env_vars),
          ..Default::default()
        }],
        restart_policy: Some("Never".to_string()),
        service_account_name: env
          .get("KERNEL_SERVICE_ACCOUNT_NAME")
          .cloned(),
        ..Default::default()
      }),
      ..Default::default()
    };

    let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
    pods.create(&PostParams::default(), &pod).await.map_err(|e| {
      ProvisionerError::BackendLaunchFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }
    })?;

    Ok(encode_handle(&namespace, &pod_name, auto_ns))
  }

  async fn discover(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError> {
    let (namespace, name, _) = decode_handle(backend_handle);
    let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
    let pod = pods.get(&name).await.map_err(|e| {
      ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }
    })?;
    let ip = pod
      .status
      .and_then(|s| s.pod_ip)
      .ok_or_else(|| ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: "pod has no assigned IP yet".to_string(),
      })?;
    Ok(DiscoveredHost { host: ip, backend_handle: backend_handle.to_string() })
  }

  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError> {
    let (namespace, name, _) = decode_handle(backend_handle);
    let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
    match pods.get(&name).await {
      Ok(pod) => {
        let phase = pod.status.and_then(|s| s.phase).unwrap_or_default();
        Ok(match phase.as_str() {
          "Running" | "Pending" => BackendStatus::Running,
          "Succeeded" => BackendStatus::Terminated,
          "Failed" => BackendStatus::Failed,
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
    backend_handle: &str,
    signum: i32,
  ) -> Result<(), ProvisionerError> {
    warn!(
      backend_handle,
      signum, "kubernetes adapter has no native signal path, relying on the communication socket"
    );
    Ok(())
  }

  async fn terminate_backend_resources(
    &self,
    _kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError> {
    let (namespace, name, auto_ns) = decode_handle(backend_handle);
    let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
    let _ = pods.delete(&name, &DeleteParams::default()).await;

    if auto_ns {
      let namespaces: Api<Namespace> = Api::all(self.client.clone());
      let _ = namespaces.delete(&namespace, &DeleteParams::default()).await;
    }
    Ok(())
  }
}
