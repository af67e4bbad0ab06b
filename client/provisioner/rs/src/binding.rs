use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::connection::ConnectionInfo;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
pub enum KernelState {
  Pending,
  Authorized,
  Launching,
  AwaitingConnection,
  Discovering,
  Running,
  Terminating,
  Terminated,
  Failed,
}

impl KernelState {
  /// Every edge the state machine is allowed to take. `Terminating`
  /// is reachable from any non-terminal state (external kill), and
  /// `Failed` is reachable from every in-flight state.
  pub fn can_transition_to(self, next: KernelState) -> bool {
    use KernelState::*;
    if matches!(self, Terminated | Failed) {
      return false;
    }
    if next == Terminating || next == Failed {
      return true;
    }
    matches!(
      (self, next),
      (Pending, Authorized)
        | (Authorized, Launching)
        | (Launching, AwaitingConnection)
        | (AwaitingConnection, Discovering)
        | (Discovering, Running)
        | (AwaitingConnection, Running)
        | (Running, Terminating)
        | (Terminating, Terminated)
    )
  }
}

/// The one entity per active kernel. Owned exclusively by its
/// lifecycle supervisor; observers read a snapshot, never the live
/// struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelBinding {
  pub kernel_id: String,
  pub username: String,
  pub state: KernelState,
  pub assigned_host: Option<String>,
  pub connection_info: Option<ConnectionInfo>,
  #[serde(skip, default = "SystemTime::now")]
  pub launch_timestamp: SystemTime,
  pub backend_handle: Option<String>,
}

impl KernelBinding {
  pub fn new(kernel_id: impl Into<String>, username: impl Into<String>) -> Self {
    Self {
      kernel_id: kernel_id.into(),
      username: username.into(),
      state: KernelState::Pending,
      assigned_host: None,
      connection_info: None,
      launch_timestamp: SystemTime::now(),
      backend_handle: None,
    }
  }

  /// Moves the binding forward, panicking on an illegal edge since
  /// that would be a supervisor bug, not a runtime condition a caller
  /// should recover from.
  pub fn transition(&mut self, next: KernelState) {
    assert!(
      self.state.can_transition_to(next),
      "illegal kernel state transition: {:?} -> {:?}",
      self.state,
      next
    );
    self.state = next;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn happy_path_is_legal() {
    let mut b = KernelBinding::new("k1", "alice");
    b.transition(KernelState::Authorized);
    b.transition(KernelState::Launching);
    b.transition(KernelState::AwaitingConnection);
    b.transition(KernelState::Discovering);
    b.transition(KernelState::Running);
    b.transition(KernelState::Terminating);
    b.transition(KernelState::Terminated);
    assert_eq!(b.state, KernelState::Terminated);
  }

  #[test]
  fn failed_is_terminal() {
    let mut b = KernelBinding::new("k1", "alice");
    b.transition(KernelState::Failed);
    assert!(!b.state.can_transition_to(KernelState::Running));
  }

  #[test]
  #[should_panic]
  fn skipping_states_is_illegal() {
    let mut b = KernelBinding::new("k1", "alice");
    b.transition(KernelState::Running);
  }

  #[test]
  fn terminating_reachable_from_any_inflight_state() {
    assert!(
      KernelState::Launching.can_transition_to(KernelState::Terminating)
    );
    assert!(
      KernelState::Discovering.can_transition_to(KernelState::Terminating)
    );
  }
}
