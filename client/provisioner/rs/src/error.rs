use thiserror::Error;

/// Every failure mode a host application can observe. Adapter-internal
/// detail (a Kubernetes API error, a failed SSH handshake) is captured
/// as context on the variant rather than exposed as a distinct type,
/// so callers only ever match against this enum.
#[derive(Debug, Error)]
pub enum ProvisionerError {
  #[error(
    "User '{user}' is not authorized to start kernel '{kernel}'."
  )]
  ForbiddenUnauthorizedList { user: String, kernel: String },

  #[error(
    "User '{user}' is not in the set of users authorized to start kernel '{kernel}'."
  )]
  ForbiddenAuthorizedList { user: String, kernel: String },

  #[error("timed out waiting for kernel '{kernel_id}' to connect")]
  LaunchTimeout { kernel_id: String },

  #[error("launch of kernel '{kernel_id}' was cancelled")]
  LaunchCancelled { kernel_id: String },

  #[error("connection payload could not be decrypted: {0}")]
  CryptoFailed(String),

  #[error("connection payload was malformed: {0}")]
  PayloadMalformed(String),

  #[error("connection payload version {found} is not supported (expected {expected})")]
  VersionMismatch { found: u32, expected: u32 },

  #[error("backend failed to launch kernel '{kernel_id}': {reason}")]
  BackendLaunchFailed { kernel_id: String, reason: String },

  #[error("backend launched kernel '{kernel_id}' but it could not be located: {reason}")]
  BackendDiscoveryFailed { kernel_id: String, reason: String },

  #[error(
    "configured port range is too small: {size} ports, minimum is {minimum}"
  )]
  PortRangeTooSmall { size: u32, minimum: u32 },

  #[error("exhausted port allocation retries for range {low}..{high}")]
  PortAllocationExhausted { low: u16, high: u16 },

  #[error("response manager could not bind a listening port: {0}")]
  ResponsePortUnavailable(String),

  #[error(
    "'{host}' is not among the configured remote hosts for pinning"
  )]
  UnknownRemoteHost { host: String },

  #[error("SSH tunnel rejected unknown host key for '{host}'")]
  TunnelHostUnknown { host: String },

  #[error("uid {uid} is not permitted to run kernels")]
  ProhibitedUid { uid: u32 },

  #[error("gid {gid} is not permitted to run kernels")]
  ProhibitedGid { gid: u32 },

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;
