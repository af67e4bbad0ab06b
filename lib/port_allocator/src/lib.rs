use std::{
  collections::HashSet,
  net::{Ipv4Addr, SocketAddrV4, TcpListener},
};

use provisioner_client::ProvisionerError;
use rand::Rng;

/// Below this range size a configured port window is rejected at
/// configuration-load time, before any kernel is ever launched.
pub const GP_MIN_PORT_RANGE_SIZE: u32 = 1000;
/// Per-port bind-and-release retries before giving up on the whole
/// allocation request.
pub const GP_MAX_PORT_RANGE_RETRIES: u32 = 5;

/// `(0, 0)` means "let the OS choose", any other pair is an inclusive
/// `[low..=high]` window the caller promises is routable.
pub fn validate_range(
  range: (u16, u16),
) -> Result<(), ProvisionerError> {
  if range == (0, 0) {
    return Ok(());
  }
  let (low, high) = range;
  let size = (high as u32).saturating_sub(low as u32) + 1;
  if size < GP_MIN_PORT_RANGE_SIZE {
    return Err(ProvisionerError::PortRangeTooSmall {
      size,
      minimum: GP_MIN_PORT_RANGE_SIZE,
    });
  }
  Ok(())
}

/// Allocates `n` distinct, currently-free TCP ports. Each candidate is
/// probed by binding and immediately releasing; there is an
/// unavoidable race between release and the caller's own bind, same
/// as every other "find a free port" routine.
pub fn allocate(
  n: usize,
  range: (u16, u16),
) -> Result<Vec<u16>, ProvisionerError> {
  validate_range(range)?;

  let mut ports = HashSet::with_capacity(n);
  let mut ordered = Vec::with_capacity(n);

  for _ in 0..n {
    let port = allocate_one(range, &ports)?;
    ports.insert(port);
    ordered.push(port);
  }

  Ok(ordered)
}

fn allocate_one(
  range: (u16, u16),
  taken: &HashSet<u16>,
) -> Result<u16, ProvisionerError> {
  let (low, high) = range;

  for _ in 0..GP_MAX_PORT_RANGE_RETRIES.max(1) {
    let candidate = if range == (0, 0) {
      0
    } else {
      rand::thread_rng().gen_range(low..=high)
    };

    if candidate != 0 && taken.contains(&candidate) {
      continue;
    }

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, candidate);
    if let Ok(listener) = TcpListener::bind(addr) {
      let bound = listener.local_addr().map_err(|e| {
        ProvisionerError::Other(anyhow::anyhow!(e))
      })?;
      drop(listener);
      if bound.port() != 0 && !taken.contains(&bound.port()) {
        return Ok(bound.port());
      }
    }
  }

  Err(ProvisionerError::PortAllocationExhausted { low, high })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_range_below_minimum_size() {
    let err = validate_range((40000, 40000)).unwrap_err();
    assert!(matches!(err, ProvisionerError::PortRangeTooSmall { .. }));
  }

  #[test]
  fn accepts_unconstrained_range() {
    assert!(validate_range((0, 0)).is_ok());
  }

  #[test]
  fn accepts_range_at_minimum_size() {
    assert!(validate_range((40000, 40999)).is_ok());
  }

  #[test]
  fn allocates_distinct_ports_within_range() {
    let range = (41000, 42500);
    let ports = allocate(5, range).unwrap();
    assert_eq!(ports.len(), 5);
    let unique: HashSet<_> = ports.iter().copied().collect();
    assert_eq!(unique.len(), 5);
    for p in ports {
      assert!(p >= range.0 && p <= range.1);
    }
  }

  #[test]
  fn allocates_from_unconstrained_range() {
    let ports = allocate(3, (0, 0)).unwrap();
    assert_eq!(ports.len(), 3);
    let unique: HashSet<_> = ports.iter().copied().collect();
    assert_eq!(unique.len(), 3);
  }
}
