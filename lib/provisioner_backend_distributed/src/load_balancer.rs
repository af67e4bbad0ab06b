use std::sync::Mutex;

use provisioner_client::{
  ProvisionerError, config::LoadBalancingAlgorithm,
};

/// The set of SSH-reachable hosts a kernel may land on, plus the
/// bookkeeping needed to pick one. Mutated only under `state`'s
/// single lock; a launch either consumes the next round-robin index
/// or the currently-least-loaded host, never both.
pub struct HostPool {
  hosts: Vec<String>,
  algorithm: LoadBalancingAlgorithm,
  state: Mutex<PoolState>,
}

struct PoolState {
  next_index: usize,
  active_counts: Vec<usize>,
}

impl HostPool {
  pub fn new(
    hosts: Vec<String>,
    algorithm: LoadBalancingAlgorithm,
  ) -> Self {
    let len = hosts.len();
    Self {
      hosts,
      algorithm,
      state: Mutex::new(PoolState {
        next_index: 0,
        active_counts: vec![0; len],
      }),
    }
  }

  /// Picks a host for a new launch. `pin` (from `KERNEL_REMOTE_HOST`)
  /// bypasses the algorithm entirely; an unknown pin is an error, not
  /// a silent fallback to load balancing.
  pub fn select(
    &self,
    pin: Option<&str>,
  ) -> Result<usize, ProvisionerError> {
    if self.hosts.is_empty() {
      return Err(ProvisionerError::Other(anyhow::anyhow!(
        "no remote hosts configured"
      )));
    }

    if let Some(pin) = pin {
      let index = self
        .hosts
        .iter()
        .position(|h| h == pin)
        .ok_or_else(|| ProvisionerError::UnknownRemoteHost {
          host: pin.to_string(),
        })?;
      self.state.lock().unwrap().active_counts[index] += 1;
      return Ok(index);
    }

    let mut state = self.state.lock().unwrap();
    let index = match self.algorithm {
      LoadBalancingAlgorithm::RoundRobin => {
        let index = state.next_index % self.hosts.len();
        state.next_index = state.next_index.wrapping_add(1);
        index
      }
      LoadBalancingAlgorithm::LeastConnection => state
        .active_counts
        .iter()
        .enumerate()
        .min_by_key(|(_, count)| **count)
        .map(|(i, _)| i)
        .unwrap(),
    };
    state.active_counts[index] += 1;
    Ok(index)
  }

  pub fn release(&self, index: usize) {
    let mut state = self.state.lock().unwrap();
    if let Some(count) = state.active_counts.get_mut(index) {
      *count = count.saturating_sub(1);
    }
  }

  pub fn host(&self, index: usize) -> &str {
    &self.hosts[index]
  }

  pub fn index_of(&self, host: &str) -> Option<usize> {
    self.hosts.iter().position(|h| h == host)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_robin_cycles_through_all_hosts() {
    let pool = HostPool::new(
      vec!["h1".into(), "h2".into(), "h3".into()],
      LoadBalancingAlgorithm::RoundRobin,
    );
    let picks: Vec<_> =
      (0..6).map(|_| pool.select(None).unwrap()).collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
  }

  #[test]
  fn least_connection_favors_freed_host() {
    let pool = HostPool::new(
      vec!["h1".into(), "h2".into(), "h3".into()],
      LoadBalancingAlgorithm::LeastConnection,
    );
    let a = pool.select(None).unwrap();
    let b = pool.select(None).unwrap();
    let _c = pool.select(None).unwrap();
    pool.release(b);
    let next = pool.select(None).unwrap();
    assert_eq!(next, b);
    assert_ne!(next, a);
  }

  #[test]
  fn pin_bypasses_algorithm() {
    let pool = HostPool::new(
      vec!["h1".into(), "h2".into()],
      LoadBalancingAlgorithm::RoundRobin,
    );
    assert_eq!(pool.select(Some("h2")).unwrap(), 1);
  }

  #[test]
  fn pinned_selection_still_counts_toward_least_connection() {
    let pool = HostPool::new(
      vec!["h1".into(), "h2".into()],
      LoadBalancingAlgorithm::LeastConnection,
    );
    let pinned = pool.select(Some("h2")).unwrap();
    pool.release(pinned);
    assert_eq!(
      pool.state.lock().unwrap().active_counts,
      vec![0, 0]
    );
  }

  #[test]
  fn unknown_pin_is_an_error() {
    let pool = HostPool::new(
      vec!["h1".into()],
      LoadBalancingAlgorithm::RoundRobin,
    );
    assert!(matches!(
      pool.select(Some("h9")),
      Err(ProvisionerError::UnknownRemoteHost { .. })
    ));
  }
}
