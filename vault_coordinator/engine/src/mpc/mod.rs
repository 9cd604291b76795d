pub mod aggregate;
pub mod coordinator;

pub use aggregate::{finalize_signature, FinalSignature, PartialSignatureShare};
pub use coordinator::sign;
