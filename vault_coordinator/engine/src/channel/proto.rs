//! Wire messages of the `tsm.v1.ECDSA` node service (see `proto/tsm.proto`).

use crate::session::SessionDescriptor;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Player {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    /// DER SubjectPublicKeyInfo used to encrypt protocol traffic to this player.
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionConfig {
    #[prost(string, tag = "1")]
    pub session_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub players: ::prost::alloc::vec::Vec<Player>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenerateKeyRequest {
    #[prost(message, optional, tag = "1")]
    pub session: ::core::option::Option<SessionConfig>,
    #[prost(uint32, tag = "2")]
    pub threshold: u32,
    #[prost(string, tag = "3")]
    pub curve: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub key_label: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenerateKeyResponse {
    #[prost(string, tag = "1")]
    pub key_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKeyRequest {
    #[prost(string, tag = "1")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(uint32, repeated, tag = "2")]
    pub chain_path: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKeyResponse {
    /// DER SubjectPublicKeyInfo of the derived key.
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignRequest {
    #[prost(message, optional, tag = "1")]
    pub session: ::core::option::Option<SessionConfig>,
    #[prost(string, tag = "2")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(uint32, repeated, tag = "3")]
    pub chain_path: ::prost::alloc::vec::Vec<u32>,
    #[prost(bytes = "vec", tag = "4")]
    pub message_hash: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub partial_signature: ::prost::alloc::vec::Vec<u8>,
}

impl From<&SessionDescriptor> for SessionConfig {
    fn from(session: &SessionDescriptor) -> Self {
        SessionConfig {
            session_id: session.session_id().to_string(),
            players: session
                .public_keys()
                .iter()
                .map(|(node, key)| Player {
                    index: node.0,
                    public_key: key.clone(),
                })
                .collect(),
        }
    }
}
