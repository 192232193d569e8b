//! Threshold MPC signing node
//!
//! A node holds a share of a secp256k1 group key and cooperates with its
//! partners to generate keys (DKG), move them to a new partner set
//! (resharing), precompute FROST nonce batches and confirm app results with
//! threshold Schnorr or FROST signatures.
//!
//! # Architecture
//!
//! - Every protocol is a sequence of named rounds driven by [`mpc::MpcInstance`]
//! - Partners pull each other's round output over [`mpc::MpcNetwork`]
//! - Runs unknown to a node are started lazily from the protocol table
//! - [`confirmation::RequestConfirmer`] fans out signing and aggregates
//!
//! # Usage
//!
//! ## Start a node
//! ```bash
//! mpc-node run --config config/node1.toml
//! ```
//!
//! ## Generate the group key
//! ```bash
//! mpc-node dkg --node http://localhost:9101 --activate
//! ```

pub mod arena;
pub mod config;
pub mod confirmation;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod logging;
pub mod mpc;
pub mod node;
pub mod protocols;
pub mod server;
pub mod signing;
pub mod transport;
pub mod types;
pub mod usage;

pub use config::{ConfigError, NodeConfig};
pub use confirmation::{ConfirmationOutcome, RequestConfirmer, Scheme};
pub use error::{NodeError, RejectionGraph, Result};
pub use keystore::{Keystore, KeystoreError};
pub use node::{MemoryCluster, Node, Peers};
pub use server::create_router;
pub use signing::{EchoApp, KeyRing, Signable, SignerService};
pub use transport::HttpTransport;
pub use types::*;
pub use usage::{FileUsageRegistry, MemoryUsageRegistry, UsageRegistry};
