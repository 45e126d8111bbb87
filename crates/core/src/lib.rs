//! Core data model shared across the Vigil operator.
//!
//! This crate holds the types that flow between the monitor, the ticket
//! store, the agent runtime, and the evaluation harness. It has no I/O;
//! every consumer crate builds on these definitions.

pub mod action;
pub mod error;
pub mod invariant;
pub mod observation;
pub mod score;
pub mod ticket;
pub mod trial;

pub use action::{ActionDefinition, ParamSpec, RiskLevel, Slo, SubjectConfig};
pub use error::VigilError;
pub use invariant::{
    Condition, InvariantConfig, InvariantScope, InvariantViolation, Severity, violation_key,
};
pub use observation::{
    ClusterFacts, EntityMetrics, EntityObservation, EntityState, Observation,
};
pub use score::{CampaignSummary, CommandCategory, TrialOutcome, TrialScore};
pub use ticket::{Ticket, TicketStatus};
pub use trial::{Campaign, CampaignSpec, ChaosKind, ChaosSpec, Trial, TrialSpec, TrialStatus};
