//! Enclave identity and sealing
//!
//! Provides the root of trust for every other component: a measurement, a
//! root secret, and the keys derived from them.

mod identity;
mod sealing;

pub use identity::{EnclaveIdentity, KeyPurpose, SEED_FILE_NAME};
pub use sealing::{derive_key_hkdf, seal_data, unseal_data, SealedData, SecureKey};
