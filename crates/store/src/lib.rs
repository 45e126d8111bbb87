//! Embedded persistence for the Vigil operator.
//!
//! One SQLite file holds every table the operator writes: tickets,
//! campaigns, and trials here; sessions and audit entries in `vigil-audit`
//! against the same pool. The pool is capped at one connection so writers
//! serialize at the driver instead of behind an explicit lock.

pub mod error;
pub mod migrations;
pub mod pool;
pub mod tickets;
pub mod trials;

pub use error::StoreError;
pub use migrations::run_migrations;
pub use pool::{connect, connect_memory};
pub use tickets::{TicketStore, TicketStoreConfig};
pub use trials::CampaignStore;
