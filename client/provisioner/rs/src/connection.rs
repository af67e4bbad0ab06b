use serde::{Deserialize, Serialize};

/// Decrypted payload delivered by the kernel-launcher over the
/// response channel, enriched with the host/pod discovered by the
/// backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
  pub kernel_id: String,
  pub ip: String,
  pub shell_port: u16,
  pub iopub_port: u16,
  pub stdin_port: u16,
  pub control_port: u16,
  pub hb_port: u16,
  pub signature_key: String,
  pub signature_scheme: String,
  pub communication_port: u16,
  pub pid: Option<u32>,
  pub pgid: Option<u32>,
}
