//! pvault-model: the vault engine
//!
//! - [`trust`]: trust graph computed from certificate items
//! - [`history`]: version trees and last-writer-wins head selection
//! - [`canonical`]: canonical item encoding, signing and verification
//! - [`keygen`]: node key material and the bounded key-generation pool
//! - [`model`]: vault and item lifecycle on top of a document store

pub mod canonical;
pub mod events;
pub mod history;
pub mod keygen;
pub mod model;
pub mod trust;

pub use events::ModelEvent;
pub use keygen::{KeyGenerator, NodeKeys};
pub use model::{ImportReport, Model, ModelSettings, SharedModel};
pub use trust::{TrustGraph, TrustedCert};
