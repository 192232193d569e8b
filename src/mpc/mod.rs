//! Generic MPC round engine

pub mod engine;
pub mod memory;
pub mod phaser;
pub mod qualify;
pub mod registry;

pub use engine::{
    MpcInstance, MpcNetwork, MpcOptions, MpcProtocol, PartnerMessage, RoundContext, RoundOutput,
};
pub use memory::{MemoryHub, MemoryNetwork, PeerHandler};
pub use registry::{
    MpcRegistry, ProtocolEnv, ProtocolFactory, ProtocolOutcome, ProtocolStore, ProtocolTable,
    RunHandle,
};
