//! Cryptographic utilities for the node layer
//!
//! This module provides node key management (secp256k1).

pub mod keys;

pub use keys::{KeyError, KeyPair, PUBLIC_KEY_LEN};
