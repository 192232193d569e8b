//! Ordered round gates
//!
//! An MPC run with `r` rounds owns a phaser with `r + 1` gates. Gate 0
//! opens when the run registers, gate `k + 1` opens once round `k` has
//! published its output. Gates open strictly in order; rejecting the
//! phaser fails every gate that has not opened yet.

use crate::error::{NodeError, Result};
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct PhaseState {
    /// Number of gates opened so far
    resolved: usize,
    rejected: Option<String>,
}

pub struct Phaser {
    gates: usize,
    state: watch::Sender<PhaseState>,
}

impl Phaser {
    pub fn new(gates: usize) -> Self {
        let (state, _) = watch::channel(PhaseState::default());
        Self { gates, state }
    }

    pub fn gates(&self) -> usize {
        self.gates
    }

    /// Open gate `level`; every lower gate must already be open
    pub fn resolve(&self, level: usize) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_modify(|state| {
            if let Some(reason) = &state.rejected {
                outcome = Err(NodeError::Aborted(reason.clone()));
            } else if level >= self.gates {
                outcome = Err(NodeError::invalid(format!(
                    "gate {} out of range ({} gates)",
                    level, self.gates
                )));
            } else if level != state.resolved {
                outcome = Err(NodeError::invalid(format!(
                    "gate {} resolved out of order (next is {})",
                    level, state.resolved
                )));
            } else {
                state.resolved += 1;
            }
        });
        outcome
    }

    /// Fail every gate that is not open yet. Only the first reason is kept.
    pub fn reject(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_if_modified(|state| {
            if state.rejected.is_some() || state.resolved == self.gates {
                return false;
            }
            state.rejected = Some(reason);
            true
        });
    }

    pub fn is_resolved(&self, level: usize) -> bool {
        self.state.borrow().resolved > level
    }

    pub fn is_rejected(&self) -> bool {
        self.state.borrow().rejected.is_some()
    }

    /// Wait until gate `level` opens or the phaser is rejected
    pub async fn wait(&self, level: usize) -> Result<()> {
        if level >= self.gates {
            return Err(NodeError::invalid(format!(
                "gate {} out of range ({} gates)",
                level, self.gates
            )));
        }
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.resolved > level {
                    return Ok(());
                }
                if let Some(reason) = &state.rejected {
                    return Err(NodeError::Aborted(reason.clone()));
                }
            }
            rx.changed()
                .await
                .map_err(|_| NodeError::Aborted("phaser dropped".into()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gates_open_in_order() {
        let phaser = Phaser::new(3);
        assert!(phaser.resolve(1).is_err());
        phaser.resolve(0).unwrap();
        phaser.resolve(1).unwrap();
        assert!(phaser.is_resolved(1));
        assert!(!phaser.is_resolved(2));
        assert!(phaser.resolve(3).is_err());
        phaser.wait(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_resolve() {
        let phaser = Arc::new(Phaser::new(2));
        let waiter = {
            let phaser = phaser.clone();
            tokio::spawn(async move { phaser.wait(1).await })
        };
        phaser.resolve(0).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        phaser.resolve(1).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reject_cascades_to_later_gates() {
        let phaser = Arc::new(Phaser::new(4));
        phaser.resolve(0).unwrap();
        let waiter = {
            let phaser = phaser.clone();
            tokio::spawn(async move { phaser.wait(3).await })
        };
        phaser.reject("round 1 failed");
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, NodeError::Aborted(reason) if reason == "round 1 failed"));

        // opened gates stay open, later ones fail
        phaser.wait(0).await.unwrap();
        assert!(phaser.wait(2).await.is_err());
        assert!(phaser.resolve(1).is_err());
    }
}
