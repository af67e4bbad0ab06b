use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use provisioner_client::{ConnectionInfo, ProvisionerError};
use provisioner_crypto::{CryptoError, ProvisionerKeypair};
use rate_limit::{RateLimiter, WithFailureRateLimit};
use rsa::RsaPrivateKey;
use tokio::{
  io::AsyncReadExt,
  net::{TcpListener, TcpStream},
  sync::oneshot,
};
use tracing::{Instrument, instrument, warn};

/// Single process-wide TCP listener that receives encrypted
/// connection payloads from every concurrently-launching kernel and
/// routes each to the task awaiting it, keyed by kernel id.
pub struct ResponseManager {
  private_key: RsaPrivateKey,
  public_key_base64: String,
  local_addr: SocketAddr,
  waiters: DashMap<String, oneshot::Sender<ConnectionInfo>>,
  limiter: Arc<RateLimiter>,
}

impl ResponseManager {
  /// Binds `ip:preferred_port`, incrementing the port up to `retries`
  /// times on `AddrInUse`, then spawns the accept loop. Returns the
  /// manager plus the address launchers should be told to connect to.
  pub async fn bind(
    ip: std::net::IpAddr,
    preferred_port: u16,
    retries: u16,
    keypair: ProvisionerKeypair,
    limiter: Arc<RateLimiter>,
  ) -> Result<Arc<Self>, ProvisionerError> {
    let public_key_base64 = keypair
      .public_key_base64()
      .map_err(ProvisionerError::Other)?;

    let mut last_err = None;
    for attempt in 0..=retries {
      let port = preferred_port.saturating_add(attempt);
      match TcpListener::bind((ip, port)).await {
        Ok(listener) => {
          let local_addr = listener.local_addr().map_err(|e| {
            ProvisionerError::ResponsePortUnavailable(e.to_string())
          })?;
          let manager = Arc::new(Self {
            private_key: keypair.private,
            public_key_base64,
            local_addr,
            waiters: DashMap::new(),
            limiter,
          });
          tokio::spawn(manager.clone().serve(listener));
          return Ok(manager);
        }
        Err(e) => last_err = Some(e),
      }
    }

    Err(ProvisionerError::ResponsePortUnavailable(
      last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no candidate ports tried".to_string()),
    ))
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn public_key_base64(&self) -> &str {
    &self.public_key_base64
  }

  /// Registers a single-shot waiter for `kernel_id`. Panics if one is
  /// already registered, since the state machine guarantees at most
  /// one in-flight launch per kernel id.
  pub fn register(&self, kernel_id: &str) -> oneshot::Receiver<ConnectionInfo> {
    let (tx, rx) = oneshot::channel();
    if self.waiters.insert(kernel_id.to_string(), tx).is_some() {
      panic!("duplicate response waiter registered for kernel '{kernel_id}'");
    }
    rx
  }

  /// Drops the waiter without fulfilling it, used on cancellation.
  pub fn unregister(&self, kernel_id: &str) {
    self.waiters.remove(kernel_id);
  }

  /// Awaits the payload for `kernel_id`, enforcing `deadline`. The
  /// waiter is always cleaned up before returning.
  pub async fn await_payload(
    &self,
    kernel_id: &str,
    rx: oneshot::Receiver<ConnectionInfo>,
    deadline: Duration,
  ) -> Result<ConnectionInfo, ProvisionerError> {
    let result = tokio::time::timeout(deadline, rx).await;
    self.unregister(kernel_id);
    match result {
      Ok(Ok(info)) => Ok(info),
      Ok(Err(_canceled)) => Err(ProvisionerError::LaunchCancelled {
        kernel_id: kernel_id.to_string(),
      }),
      Err(_elapsed) => Err(ProvisionerError::LaunchTimeout {
        kernel_id: kernel_id.to_string(),
      }),
    }
  }

  async fn serve(self: Arc<Self>, listener: TcpListener) {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let manager = self.clone();
          let ip = peer.ip();
          tokio::spawn(
            async move {
              let limiter = manager.limiter.clone();
              let result = async { manager.handle_connection(stream).await }
                .with_failure_rate_limit(&limiter, &ip)
                .await;
              if let Err(e) = result {
                warn!("response connection rejected: {e}");
              }
            }
            .instrument(tracing::info_span!("response_conn", %peer)),
          );
        }
        Err(e) => {
          warn!("response manager accept failed: {e}");
        }
      }
    }
  }

  #[instrument(skip(self, stream))]
  async fn handle_connection(
    &self,
    mut stream: TcpStream,
  ) -> anyhow::Result<()> {
    let mut blob = String::new();
    stream
      .read_to_string(&mut blob)
      .await
      .map_err(|e| anyhow::anyhow!("failed to read response payload: {e}"))?;

    let conn_info = match provisioner_crypto::decrypt_payload(
      &blob,
      &self.private_key,
    ) {
      Ok(info) => info,
      Err(CryptoError::Malformed(reason)) => {
        return Err(anyhow::anyhow!(
          "dropped malformed response payload: {reason}"
        ));
      }
      Err(CryptoError::VersionMismatch { found, expected }) => {
        return Err(anyhow::anyhow!(
          "dropped response payload with unsupported version {found} (expected {expected})"
        ));
      }
      Err(CryptoError::Failed(reason)) => {
        return Err(anyhow::anyhow!(
          "failed to decrypt response payload: {reason}"
        ));
      }
    };

    let Some((_, tx)) = self.waiters.remove(&conn_info.kernel_id) else {
      return Err(anyhow::anyhow!(
        "orphan response payload: no waiter registered for kernel '{}'",
        conn_info.kernel_id
      ));
    };

    let _ = tx.send(conn_info);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use provisioner_crypto::encrypt_payload;
  use std::net::Ipv4Addr;
  use tokio::io::AsyncWriteExt;

  fn sample_conn_info(kernel_id: &str) -> ConnectionInfo {
    ConnectionInfo {
      kernel_id: kernel_id.to_string(),
      ip: "127.0.0.1".to_string(),
      shell_port: 1,
      iopub_port: 2,
      stdin_port: 3,
      control_port: 4,
      hb_port: 5,
      signature_key: "sig".to_string(),
      signature_scheme: "hmac-sha256".to_string(),
      communication_port: 6,
      pid: None,
      pgid: None,
    }
  }

  #[tokio::test]
  async fn routes_payload_to_matching_waiter() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let public = rsa::RsaPublicKey::from(&keypair.private);
    let manager = ResponseManager::bind(
      Ipv4Addr::LOCALHOST.into(),
      0,
      3,
      keypair,
      RateLimiter::new(true, 5, 60),
    )
    .await
    .unwrap();

    let rx = manager.register("k1");

    let blob =
      encrypt_payload(&sample_conn_info("k1"), &public).unwrap();
    let mut stream =
      TcpStream::connect(manager.local_addr()).await.unwrap();
    stream.write_all(blob.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let info = manager
      .await_payload("k1", rx, Duration::from_secs(2))
      .await
      .unwrap();
    assert_eq!(info.kernel_id, "k1");
  }

  #[tokio::test]
  async fn unmatched_kernel_id_leaves_waiter_to_time_out() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let public = rsa::RsaPublicKey::from(&keypair.private);
    let manager = ResponseManager::bind(
      Ipv4Addr::LOCALHOST.into(),
      0,
      3,
      keypair,
      RateLimiter::new(true, 5, 60),
    )
    .await
    .unwrap();

    let rx = manager.register("k1");

    let blob =
      encrypt_payload(&sample_conn_info("someone-else"), &public)
        .unwrap();
    let mut stream =
      TcpStream::connect(manager.local_addr()).await.unwrap();
    stream.write_all(blob.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let result = manager
      .await_payload("k1", rx, Duration::from_millis(200))
      .await;
    assert!(matches!(result, Err(ProvisionerError::LaunchTimeout { .. })));
  }
}
