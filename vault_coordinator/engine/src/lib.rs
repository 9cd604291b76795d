//! Vault Coordinator Core Library
//!
//! Drives threshold ECDSA key generation and signing across a fixed set of
//! signing nodes reached over pinned, mutually authenticated gRPC channels.

pub mod audit;
pub mod chain;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod derive;
pub mod dkg;
pub mod error;
pub mod logging;
pub mod mpc;
pub mod session;
pub mod simulated;
pub mod types;

mod fanout;

pub use channel::{ChannelFactory, ClientCredential, NodeChannel, NodeIdentity, NodePool};
pub use config::CoordinatorConfig;
pub use coordinator::ThresholdCoordinator;
pub use derive::DerivedPublicKey;
pub use error::{CoordinatorError, NodeError, Result};
pub use mpc::FinalSignature;
pub use session::{SessionDescriptor, SessionDescriptorBuilder};
pub use types::{DerivationPath, MasterKeyHandle, MessageDigest, NodeIndex, PartialSignature};
