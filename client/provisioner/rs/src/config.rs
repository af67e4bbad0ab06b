use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Resolved policy for one kernel launch: process-wide defaults
/// merged with the per-kernel `provisioner.config` stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
  #[serde(default)]
  pub authorized_users: HashSet<String>,
  #[serde(default)]
  pub unauthorized_users: HashSet<String>,
  pub port_range: (u16, u16),
  pub launch_timeout_secs: u64,
  pub impersonation_enabled: bool,
  pub tunneling_enabled: bool,
  #[serde(default)]
  pub load_balancing_algorithm: LoadBalancingAlgorithm,
  #[serde(default)]
  pub prohibited_uids: HashSet<u32>,
  #[serde(default)]
  pub prohibited_gids: HashSet<u32>,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum LoadBalancingAlgorithm {
  #[default]
  RoundRobin,
  LeastConnection,
}

impl ProvisionerConfig {
  /// Scalars in `overlay` win; `unauthorized_users` is amended
  /// (unioned) rather than replaced, since denial should only ever
  /// grow more conservative per-kernel, never shrink.
  pub fn merge(&self, overlay: &PartialProvisionerConfig) -> Self {
    let mut merged = self.clone();

    if let Some(users) = &overlay.authorized_users {
      merged.authorized_users = users.clone();
    }
    if let Some(users) = &overlay.unauthorized_users {
      merged.unauthorized_users =
        merged.unauthorized_users.union(users).cloned().collect();
    }
    if let Some(range) = overlay.port_range {
      merged.port_range = range;
    }
    if let Some(timeout) = overlay.launch_timeout_secs {
      merged.launch_timeout_secs = timeout;
    }
    if let Some(v) = overlay.impersonation_enabled {
      merged.impersonation_enabled = v;
    }
    if let Some(v) = overlay.tunneling_enabled {
      merged.tunneling_enabled = v;
    }
    if let Some(algo) = overlay.load_balancing_algorithm {
      merged.load_balancing_algorithm = algo;
    }
    if let Some(uids) = &overlay.prohibited_uids {
      merged.prohibited_uids = merged.prohibited_uids.union(uids).cloned().collect();
    }
    if let Some(gids) = &overlay.prohibited_gids {
      merged.prohibited_gids = merged.prohibited_gids.union(gids).cloned().collect();
    }

    merged
  }

  /// Denies launch outright for a prohibited container identity,
  /// independent of user authorization. Either field may be absent
  /// when the launcher doesn't report an identity (e.g. YARN).
  pub fn check_identity(
    &self,
    uid: Option<u32>,
    gid: Option<u32>,
  ) -> Result<(), crate::error::ProvisionerError> {
    if let Some(uid) = uid
      && self.prohibited_uids.contains(&uid)
    {
      return Err(crate::error::ProvisionerError::ProhibitedUid { uid });
    }
    if let Some(gid) = gid
      && self.prohibited_gids.contains(&gid)
    {
      return Err(crate::error::ProvisionerError::ProhibitedGid { gid });
    }
    Ok(())
  }

  /// Returns `Err` with the denial reason text if `username` may not
  /// start `kernel_display_name`. Unauthorized-list denial always
  /// takes precedence over a non-empty authorized-list miss.
  pub fn check_authorized(
    &self,
    username: &str,
    kernel_display_name: &str,
  ) -> Result<(), crate::error::ProvisionerError> {
    if self.unauthorized_users.contains(username) {
      return Err(
        crate::error::ProvisionerError::ForbiddenUnauthorizedList {
          user: username.to_string(),
          kernel: kernel_display_name.to_string(),
        },
      );
    }
    if !self.authorized_users.is_empty()
      && !self.authorized_users.contains(username)
    {
      return Err(
        crate::error::ProvisionerError::ForbiddenAuthorizedList {
          user: username.to_string(),
          kernel: kernel_display_name.to_string(),
        },
      );
    }
    Ok(())
  }
}

/// The per-kernel override stanza, parsed out of
/// `KernelSpec.provisioner.config`. Every field is optional: only
/// fields present in the spec's config override the process default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialProvisionerConfig {
  pub authorized_users: Option<HashSet<String>>,
  pub unauthorized_users: Option<HashSet<String>>,
  pub port_range: Option<(u16, u16)>,
  pub launch_timeout_secs: Option<u64>,
  pub impersonation_enabled: Option<bool>,
  pub tunneling_enabled: Option<bool>,
  pub load_balancing_algorithm: Option<LoadBalancingAlgorithm>,
  pub prohibited_uids: Option<HashSet<u32>>,
  pub prohibited_gids: Option<HashSet<u32>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> ProvisionerConfig {
    ProvisionerConfig {
      authorized_users: HashSet::new(),
      unauthorized_users: ["root".to_string()].into_iter().collect(),
      port_range: (0, 0),
      launch_timeout_secs: 30,
      impersonation_enabled: false,
      tunneling_enabled: false,
      load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
      prohibited_uids: HashSet::new(),
      prohibited_gids: HashSet::new(),
    }
  }

  #[test]
  fn prohibited_uid_denies_regardless_of_authorization() {
    let mut cfg = base();
    cfg.prohibited_uids.insert(0);
    assert!(matches!(
      cfg.check_identity(Some(0), None),
      Err(crate::error::ProvisionerError::ProhibitedUid { uid: 0 })
    ));
    assert!(cfg.check_identity(Some(1000), None).is_ok());
  }

  #[test]
  fn unauthorized_list_denies_even_if_authorized_list_allows() {
    let mut cfg = base();
    cfg.authorized_users.insert("root".to_string());
    assert!(cfg.check_authorized("root", "k").is_err());
  }

  #[test]
  fn empty_authorized_list_allows_anyone_not_denied() {
    let cfg = base();
    assert!(cfg.check_authorized("alice", "k").is_ok());
  }

  #[test]
  fn nonempty_authorized_list_denies_non_members() {
    let mut cfg = base();
    cfg.authorized_users.insert("alice".to_string());
    assert!(cfg.check_authorized("bob", "k").is_err());
    assert!(cfg.check_authorized("alice", "k").is_ok());
  }

  #[test]
  fn unauthorized_users_amend_rather_than_replace() {
    let cfg = base();
    let overlay = PartialProvisionerConfig {
      unauthorized_users: Some(
        ["bob".to_string()].into_iter().collect(),
      ),
      ..Default::default()
    };
    let merged = cfg.merge(&overlay);
    assert!(merged.unauthorized_users.contains("root"));
    assert!(merged.unauthorized_users.contains("bob"));
  }

  #[test]
  fn port_range_override_replaces_scalar() {
    let cfg = base();
    let overlay = PartialProvisionerConfig {
      port_range: Some((40000, 41000)),
      ..Default::default()
    };
    assert_eq!(cfg.merge(&overlay).port_range, (40000, 41000));
  }
}
