use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use provisioner_client::ProvisionerError;
use provisioner_core::tunnel::Tunneler;
use russh::{
  ChannelMsg,
  client::{self, Handle},
};
use russh_keys::key::PublicKey;
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::TcpListener,
  sync::Mutex,
};
use tracing::{info, warn};

/// Strict host-key policy: a host must appear in the operator-supplied
/// allowlist (typically seeded from `~/.ssh/known_hosts`) with a
/// matching key, or the tunnel is refused outright.
struct KnownHostsHandler {
  expected: HashMap<String, PublicKey>,
  host: String,
}

#[async_trait::async_trait]
impl client::Handler for KnownHostsHandler {
  type Error = russh::Error;

  async fn check_server_key(
    &mut self,
    server_public_key: &PublicKey,
  ) -> Result<bool, Self::Error> {
    Ok(match self.expected.get(&self.host) {
      Some(expected) => expected == server_public_key,
      None => false,
    })
  }
}

/// Establishes SSH local port forwards for the five ZMQ ports plus
/// the communication port of a kernel, tearing them all down together
/// on terminate. Only active when the operator has enabled tunneling
/// globally; most deployments run with direct connectivity instead.
pub struct SshTunneler {
  known_hosts: HashMap<String, PublicKey>,
  ssh_port: u16,
  ssh_user: String,
  ssh_password: Option<String>,
  active: Mutex<HashMap<String, Vec<tokio::task::JoinHandle<()>>>>,
}

impl SshTunneler {
  pub fn new(
    known_hosts: HashMap<String, PublicKey>,
    ssh_port: u16,
    ssh_user: String,
    ssh_password: Option<String>,
  ) -> Self {
    Self {
      known_hosts,
      ssh_port,
      ssh_user,
      ssh_password,
      active: Mutex::new(HashMap::new()),
    }
  }

  /// Opens one local forward per `(local_port, remote_port)` pair onto
  /// `remote_host`, keyed by `kernel_id` for later teardown.
  pub async fn open_tunnels(
    &self,
    kernel_id: &str,
    remote_host: &str,
    ports: &[(u16, u16)],
  ) -> Result<(), ProvisionerError> {
    let config = Arc::new(client::Config::default());
    let handler = KnownHostsHandler {
      expected: self.known_hosts.clone(),
      host: remote_host.to_string(),
    };

    let mut session = client::connect(
      config,
      (remote_host, self.ssh_port),
      handler,
    )
    .await
    .map_err(|e| {
      if matches!(e, russh::Error::UnknownKey) {
        ProvisionerError::TunnelHostUnknown { host: remote_host.to_string() }
      } else {
        ProvisionerError::Other(anyhow::anyhow!(
          "SSH connection to {remote_host} failed: {e}"
        ))
      }
    })?;

    let authenticated = if let Some(password) = &self.ssh_password {
      session
        .authenticate_password(&self.ssh_user, password)
        .await
        .map_err(|e| ProvisionerError::Other(anyhow::anyhow!(e)))?
    } else {
      false
    };
    if !authenticated {
      return Err(ProvisionerError::Other(anyhow::anyhow!(
        "SSH authentication to {remote_host} failed"
      )));
    }

    let session = Arc::new(Mutex::new(session));
    let mut handles = Vec::with_capacity(ports.len());

    for &(local_port, remote_port) in ports {
      let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
          for handle in handles {
            handle.abort();
          }
          return Err(ProvisionerError::Other(anyhow::anyhow!(
            "failed to bind local tunnel port {local_port}: {e}"
          )));
        }
      };
      let session = session.clone();
      let remote_host = remote_host.to_string();
      handles.push(tokio::spawn(forward_loop(
        listener,
        session,
        remote_host,
        remote_port,
      )));
    }

    self.active.lock().await.insert(kernel_id.to_string(), handles);
    Ok(())
  }

  pub async fn close_tunnels(&self, kernel_id: &str) {
    if let Some(handles) = self.active.lock().await.remove(kernel_id) {
      for handle in handles {
        handle.abort();
      }
    }
  }
}

#[async_trait]
impl Tunneler for SshTunneler {
  async fn open_tunnels(
    &self,
    kernel_id: &str,
    host: &str,
    ports: &[(u16, u16)],
  ) -> Result<(), ProvisionerError> {
    self.open_tunnels(kernel_id, host, ports).await
  }

  async fn close_tunnels(&self, kernel_id: &str) {
    self.close_tunnels(kernel_id).await
  }
}

async fn forward_loop(
  listener: TcpListener,
  session: Arc<Mutex<Handle<KnownHostsHandler>>>,
  remote_host: String,
  remote_port: u16,
) {
  loop {
    let (mut local_stream, peer) = match listener.accept().await {
      Ok(pair) => pair,
      Err(e) => {
        warn!("tunnel accept failed: {e}");
        continue;
      }
    };

    let channel = {
      let session = session.lock().await;
      session
        .channel_open_direct_tcpip(
          remote_host.clone(),
          remote_port as u32,
          peer.ip().to_string(),
          peer.port() as u32,
        )
        .await
    };

    let mut channel = match channel {
      Ok(c) => c,
      Err(e) => {
        warn!("failed to open direct-tcpip channel to {remote_host}:{remote_port}: {e}");
        continue;
      }
    };

    tokio::spawn(async move {
      let mut buf = [0u8; 8192];
      loop {
        tokio::select! {
          read = local_stream.read(&mut buf) => {
            match read {
              Ok(0) | Err(_) => break,
              Ok(n) => {
                if channel.data(&buf[..n]).await.is_err() {
                  break;
                }
              }
            }
          }
          msg = channel.wait() => {
            match msg {
              Some(ChannelMsg::Data { data }) => {
                if local_stream.write_all(&data).await.is_err() {
                  break;
                }
              }
              Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
              _ => {}
            }
          }
        }
      }
      info!("tunnel connection to {remote_host}:{remote_port} closed");
    });
  }
}
