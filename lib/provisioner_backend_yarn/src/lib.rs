use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use provisioner_client::{KernelSpec, ProvisionerConfig, ProvisionerError};
use provisioner_core::adapter::{
  BackendAdapter, BackendStatus, DiscoveredHost,
};
use serde::Deserialize;
use tracing::{instrument, warn};

const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DISCOVERY_MAX_ATTEMPTS: u32 = 40;

/// Submits the kernel via the spec's own launch script (a YARN
/// application can only be started by the tooling that knows how to
/// assemble its classpath/resources), then locates it by the
/// `--name {kernel_id}` the script was told to pass through, and
/// drives it afterward purely over the REST API.
pub struct YarnAdapter {
  http: reqwest::Client,
  endpoint: String,
  alt_endpoint: Option<String>,
}

impl YarnAdapter {
  pub fn new(endpoint: String, alt_endpoint: Option<String>) -> Self {
    Self { http: reqwest::Client::new(), endpoint, alt_endpoint }
  }

  fn endpoints(&self) -> Vec<&str> {
    let mut v = vec![self.endpoint.as_str()];
    if let Some(alt) = &self.alt_endpoint {
      v.push(alt.as_str());
    }
    v
  }

  async fn find_app_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<YarnApp>> {
    for endpoint in self.endpoints() {
      let url = format!("{endpoint}/ws/v1/cluster/apps");
      let resp = match self.http.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
          warn!("YARN endpoint {endpoint} unreachable: {e}");
          continue;
        }
      };
      let body: YarnAppsResponse = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
          warn!("YARN endpoint {endpoint} returned unparseable body: {e}");
          continue;
        }
      };
      if let Some(apps) = body.apps {
        if let Some(app) = apps.app.into_iter().find(|a| a.name == name) {
          return Ok(Some(app));
        }
      }
    }
    Ok(None)
  }

  async fn get_app(&self, app_id: &str) -> anyhow::Result<YarnApp> {
    let mut last_err = None;
    for endpoint in self.endpoints() {
      let url = format!("{endpoint}/ws/v1/cluster/apps/{app_id}");
      match self.http.get(&url).send().await {
        Ok(resp) => match resp.json::<YarnAppResponse>().await {
          Ok(body) => return Ok(body.app),
          Err(e) => last_err = Some(e.into()),
        },
        Err(e) => last_err = Some(e.into()),
      }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no reachable YARN endpoint")))
  }
}

#[derive(Deserialize)]
struct YarnAppsResponse {
  apps: Option<YarnApps>,
}

#[derive(Deserialize)]
struct YarnApps {
  app: Vec<YarnApp>,
}

#[derive(Deserialize)]
struct YarnAppResponse {
  app: YarnApp,
}

#[derive(Deserialize, Clone)]
struct YarnApp {
  id: String,
  name: String,
  state: String,
  #[serde(rename = "amHostHttpAddress")]
  am_host_http_address: Option<String>,
}

fn map_state(state: &str) -> BackendStatus {
  match state {
    "NEW" | "NEW_SAVING" | "SUBMITTED" | "ACCEPTED" | "RUNNING" => {
      BackendStatus::Running
    }
    "FINISHED" => BackendStatus::Terminated,
    "FAILED" | "KILLED" => BackendStatus::Failed,
    _ => BackendStatus::Unknown,
  }
}

#[async_trait]
impl BackendAdapter for YarnAdapter {
  fn name(&self) -> &'static str {
    "yarn"
  }

  #[instrument(skip(self, argv, env, _config, _spec))]
  async fn spawn(
    &self,
    kernel_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    _config: &ProvisionerConfig,
    _spec: &KernelSpec,
  ) -> Result<String, ProvisionerError> {
    let mut cmd_env = std::env::vars().collect::<HashMap<_, _>>();
    cmd_env.extend(env.clone());
    let command_line = shell_words_join(argv);

    let log = command::run_shell_command_logged(
      "yarn-submit",
      None,
      with_env_prefix(&command_line, &cmd_env),
    )
    .await;

    if !log.success {
      return Err(ProvisionerError::BackendLaunchFailed {
        kernel_id: kernel_id.to_string(),
        reason: format!("launch script failed: {}", log.stderr),
      });
    }

    // The application is located by name afterward; until then the
    // handle is just the kernel id the script was told to submit as.
    Ok(kernel_id.to_string())
  }

  async fn discover(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<DiscoveredHost, ProvisionerError> {
    for _ in 0..DISCOVERY_MAX_ATTEMPTS {
      match self.find_app_by_name(backend_handle).await {
        Ok(Some(app)) if map_state(&app.state) != BackendStatus::Unknown => {
          let host = app
            .am_host_http_address
            .as_deref()
            .and_then(|addr| addr.split(':').next())
            .unwrap_or_default()
            .to_string();
          return Ok(DiscoveredHost { host, backend_handle: app.id });
        }
        Ok(_) => tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await,
        Err(e) => {
          warn!("YARN discovery attempt failed: {e}");
          tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        }
      }
    }
    Err(ProvisionerError::BackendDiscoveryFailed {
      kernel_id: kernel_id.to_string(),
      reason: format!(
        "no YARN application named '{backend_handle}' appeared within {} attempts",
        DISCOVERY_MAX_ATTEMPTS
      ),
    })
  }

  async fn status(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<BackendStatus, ProvisionerError> {
    let app = self.get_app(backend_handle).await.map_err(|e| {
      ProvisionerError::BackendDiscoveryFailed {
        kernel_id: kernel_id.to_string(),
        reason: e.to_string(),
      }
    })?;
    Ok(map_state(&app.state))
  }

  async fn send_native_signal(
    &self,
    _kernel_id: &str,
    _backend_handle: &str,
    _signum: i32,
  ) -> Result<(), ProvisionerError> {
    // YARN has no per-task signal API; the communication socket is
    // the only channel.
    Ok(())
  }

  async fn terminate_backend_resources(
    &self,
    kernel_id: &str,
    backend_handle: &str,
  ) -> Result<(), ProvisionerError> {
    for endpoint in self.endpoints() {
      let url = format!("{endpoint}/ws/v1/cluster/apps/{backend_handle}/state");
      let result = self
        .http
        .put(&url)
        .json(&serde_json::json!({ "state": "KILLED" }))
        .send()
        .await;
      if result.is_ok() {
        return Ok(());
      }
    }
    warn!(kernel_id, "failed to kill YARN application {backend_handle} on any endpoint");
    Ok(())
  }
}

fn shell_words_join(argv: &[String]) -> String {
  argv
    .iter()
    .map(|a| shell_escape::escape(a.into()).to_string())
    .collect::<Vec<_>>()
    .join(" ")
}

fn with_env_prefix(command: &str, env: &HashMap<String, String>) -> String {
  let prefix = env
    .iter()
    .map(|(k, v)| format!("{k}={}", shell_escape::escape(v.into())))
    .collect::<Vec<_>>()
    .join(" ");
  if prefix.is_empty() {
    command.to_string()
  } else {
    format!("{prefix} {command}")
  }
}
