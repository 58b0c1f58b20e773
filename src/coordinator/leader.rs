//! Leadership state for the mutation apply loop
//!
//! Exactly one process applies queued mutations at a time. The election
//! itself happens elsewhere; this node only records the outcome it was told.

use crate::common::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

struct LeaderInfo {
    role: Role,
    leader_id: Option<String>,
}

pub struct Leadership {
    node_id: String,
    term: AtomicU64,
    info: Mutex<LeaderInfo>,
}

impl Leadership {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            term: AtomicU64::new(0),
            info: Mutex::new(LeaderInfo {
                role: Role::Follower,
                leader_id: None,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn role(&self) -> Role {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).role
    }

    pub fn leader(&self) -> Option<String> {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leader_id
            .clone()
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// Take leadership for a new term
    pub fn become_leader(&self) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        self.term.fetch_add(1, Ordering::SeqCst);
        info.role = Role::Leader;
        info.leader_id = Some(self.node_id.clone());
        tracing::info!(node = %self.node_id, term = self.term(), "became leader");
    }

    /// Step down to follower
    pub fn step_down(&self, new_term: u64, leader_id: Option<String>) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        self.term.fetch_max(new_term, Ordering::SeqCst);
        info.role = Role::Follower;
        info.leader_id = leader_id;
    }

    /// Fail with `NotLeader` unless this node leads
    pub fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        Err(Error::NotLeader(
            self.leader().unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leadership_transitions() {
        let node = Leadership::new("coord-1");
        assert_eq!(node.role(), Role::Follower);
        assert!(matches!(node.ensure_leader(), Err(Error::NotLeader(l)) if l == "unknown"));

        node.become_leader();
        assert!(node.is_leader());
        assert_eq!(node.term(), 1);
        assert_eq!(node.leader().as_deref(), Some("coord-1"));
        assert!(node.ensure_leader().is_ok());

        node.step_down(5, Some("coord-2".into()));
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.term(), 5);
        assert!(matches!(node.ensure_leader(), Err(Error::NotLeader(l)) if l == "coord-2"));
    }
}
