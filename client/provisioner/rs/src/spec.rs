use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The kernel-spec document the host hands to the registry. Mirrors
/// the on-disk `kernel.json` plus the provisioner metadata stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
  pub display_name: String,
  pub language: String,
  /// Ordered argv with `{kernel_id}`, `{response_address}`,
  /// `{public_key}`, `{port_range}` placeholders, substituted at
  /// launch time.
  pub argv: Vec<String>,
  #[serde(default)]
  pub env: HashMap<String, String>,
  pub provisioner: ProvisionerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerSpec {
  pub provisioner_name: String,
  #[serde(default)]
  pub config: HashMap<String, serde_json::Value>,
}

/// Replaces the four launcher placeholders in each argv entry.
/// Unknown `{...}` tokens are left untouched since some launchers
/// pass through kernel-class specific switches of their own.
pub fn substitute_placeholders(
  argv: &[String],
  kernel_id: &str,
  response_address: &str,
  public_key: &str,
  port_range: &str,
) -> Vec<String> {
  argv
    .iter()
    .map(|arg| {
      arg
        .replace("{kernel_id}", kernel_id)
        .replace("{response_address}", response_address)
        .replace("{public_key}", public_key)
        .replace("{port_range}", port_range)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn substitutes_all_known_placeholders() {
    let argv = vec![
      "launcher".to_string(),
      "--kernel-id".to_string(),
      "{kernel_id}".to_string(),
      "--response-address".to_string(),
      "{response_address}".to_string(),
      "--public-key".to_string(),
      "{public_key}".to_string(),
      "--port-range".to_string(),
      "{port_range}".to_string(),
      "--spark-mode".to_string(),
    ];
    let out = substitute_placeholders(
      &argv,
      "abc-123",
      "10.0.0.1:9001",
      "base64key",
      "40000..41000",
    );
    assert_eq!(out[2], "abc-123");
    assert_eq!(out[4], "10.0.0.1:9001");
    assert_eq!(out[6], "base64key");
    assert_eq!(out[8], "40000..41000");
    assert_eq!(out[9], "--spark-mode");
  }
}
