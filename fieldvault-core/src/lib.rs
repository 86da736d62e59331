//! FieldVault Core - Versioned field encryption and key rotation
//!
//! This crate provides the foundational components for FieldVault:
//! - The versioned ciphertext envelope format (with legacy compatibility)
//! - Key resolution and active-version management
//! - AES-256-GCM field encryption/decryption
//! - The batched, zero-downtime key rotation pipeline

pub mod audit;
pub mod config;
pub mod envelope;
pub mod field_crypto;
pub mod provider;
pub mod rotation;
pub mod store;

pub use audit::*;
pub use config::*;
pub use envelope::{classify, Classification, Envelope, EnvelopeError};
pub use field_crypto::*;
pub use provider::*;
pub use rotation::*;
pub use store::*;
