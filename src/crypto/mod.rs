//! Identity primitives: local key material and the peer model.

pub mod identity;

pub use identity::*;
