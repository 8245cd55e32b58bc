//! Domain model: value objects, entities and the ports the application layer
//! talks to. Nothing in here performs I/O.

pub mod appeal;
pub mod appointment;
pub mod audit;
pub mod gateway;
pub mod ids;
pub mod ledger;
pub mod money;
pub mod ports;
pub mod reports;
pub mod settlement;
