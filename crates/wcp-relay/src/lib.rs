//! Relay transport seam and the encrypting pub/sub client.
//!
//! The relay is an untrusted topic bus: it moves opaque bytes and nothing
//! else. [`transport::RelayTransport`] is the seam an embedder implements
//! against a real relay; [`memory::RelayHub`] is the in-process
//! implementation the tests run on; [`client::RelayClient`] layers
//! encryption, request/response correlation, and duplicate suppression on
//! top of whichever transport is plugged in.

pub mod client;
pub mod dedup;
pub mod memory;
pub mod transport;

pub use client::{InboundRequest, RelayClient};
pub use memory::RelayHub;
pub use transport::{RelayError, RelayMessage, RelayTransport, SubscriptionId};
