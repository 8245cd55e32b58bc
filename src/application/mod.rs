//! Application layer containing the settlement, appeal and reconciliation logic.
//!
//! `LedgerEngine` wires the services together. Operations on one appointment
//! (or one appeal) are serialized through keyed async locks; everything else
//! runs concurrently against the shared stores.

pub mod appeals;
pub mod audit;
pub mod engine;
pub mod locks;
pub mod policy;
pub mod reconciliation;
pub mod settlement;
