//! Protocols run on the MPC engine

pub mod dkg;
pub mod nonce;
pub mod reshare;

pub use dkg::{DistKey, DkgFactory, DkgProtocol};
pub use nonce::{BatchCursor, NonceBatch, NonceBatchFactory};
pub use reshare::ReshareFactory;

use crate::error::Result;
use crate::mpc::{MpcInstance, MpcProtocol, ProtocolEnv, ProtocolOutcome, RunHandle};
use crate::types::MpcInit;
use std::sync::Arc;

/// What to do with a finished run's output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Keep it in the session cache only
    Cache,
    /// Also make it the node's active key or batch
    Activate,
    /// Output is a one-time Schnorr nonce, never usable as a key
    Nonce,
}

impl Activation {
    pub fn from_flag(activate: bool) -> Self {
        if activate {
            Self::Activate
        } else {
            Self::Cache
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Activate
    }
}

/// Spawn a key producing run and hand the key to the store when it finishes
pub(crate) fn spawn_key_run<P>(
    env: &ProtocolEnv,
    init: MpcInit,
    protocol: P,
    activation: Activation,
) -> Result<RunHandle>
where
    P: MpcProtocol<Output = DistKey>,
{
    let instance = MpcInstance::new(init, env.self_id, protocol.rounds())?;
    let env = env.clone();
    Ok(tokio::spawn(async move {
        let key = instance
            .run(protocol, env.network.clone(), &env.options)
            .await?;
        let key = Arc::new(key);
        match activation {
            Activation::Nonce => env.store.save_nonce(instance.id(), key.clone()).await?,
            _ => {
                env.store
                    .save_key(instance.id(), key.clone(), activation.is_active())
                    .await?
            }
        }
        Ok(ProtocolOutcome::Key(key))
    }))
}
