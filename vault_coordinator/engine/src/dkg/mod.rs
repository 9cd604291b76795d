//! Distributed key generation across the node pool.

pub mod coordinator;

pub use coordinator::{agreed_key_id, generate_key, KeyGenParams};
