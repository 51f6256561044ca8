//! Core client state machine for the WCP protocol.
//!
//! This crate implements:
//! - The generic sequence lifecycle (proposal, pending, settled, updated,
//!   deleted) and its pairing and session instantiations
//! - Per-topic concurrency discipline and response correlation
//! - Subscription tracking with expiry sweeping
//! - Storage layout and rehydration
//! - The pairing URI
//! - The client facade and its lifecycle event stream

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod event;
pub mod pairing;
pub mod sequence;
pub mod session;
pub mod store;
pub mod subscription;
pub mod types;
pub mod uri;

pub use client::{Client, ClientConfig, ConnectParams, RequestParams};
pub use error::ClientError;
pub use event::ClientEvent;
pub use pairing::{PairingProposal, SettledPairing};
pub use session::{SessionProposal, SettledSession};
pub use types::{
    AppMetadata, Notification, PairingPermissions, Reason, RelayProtocol, SessionPermissions,
    SessionState,
};
pub use uri::PairingUri;
