//! Session layer: identity handshake, routing and application notifications.
//!
//! [`SessionManager`] sits between transports and the application; delegates
//! registered with it receive [`SessionEvent`] notifications.

pub mod delegate;
pub mod manager;

pub use delegate::*;
pub use manager::*;
