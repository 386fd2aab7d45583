//! pvault-sync: replication between nodes
//!
//! - [`transport`]: TLS 1.3 connections and their channel bindings
//! - [`wire`]: authentication headers, PIN proofs, status mapping
//! - [`pairing`]: PIN pairing, responder side plus the human-in-the-loop traits
//! - [`server`]: axum routes for pairing, pull and push
//! - [`client`]: the initiator side of pairing and sync
//! - [`locator`]: neighbor discovery port
//! - [`scheduler`]: periodic and event-driven sync rounds

pub mod client;
pub mod events;
pub mod locator;
pub mod pairing;
pub mod scheduler;
pub mod server;
pub mod transport;
pub mod wire;

pub use client::{SyncClient, SyncReport};
pub use events::SyncEvent;
pub use locator::{Locator, LocatorEvent, Neighbor, Registration, StaticLocator};
pub use pairing::{Approver, AutoApprove, FixedPin, PairingRequest, PairingResponder, PinPrompt};
pub use scheduler::{Connector, RoundReport, SyncScheduler, TlsDialer};
pub use server::{ServerContext, SyncServer};
pub use transport::ChannelBinding;
