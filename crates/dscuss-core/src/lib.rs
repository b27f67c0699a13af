//! Cryptographic primitives, proof-of-work, topic algebra and the entity
//! model shared by the Dscuss node engine.
//!
//! # Modules
//!
//! - [`crypto`]: secp224r1 keypairs, DER/PEM codec, signing, SHA-512, PBKDF2.
//! - [`pow`]: the resumable proof-of-work searcher and validator.
//! - [`topic`]: tag-set normalization, containment, subscriptions.
//! - [`entity`]: User/Message/Operation wire layouts and signature binding.
//! - [`error`]: the crate's error taxonomy.

pub mod crypto;
pub mod entity;
pub mod error;
pub mod pow;
pub mod topic;
