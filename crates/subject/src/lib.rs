//! Subject abstraction layer: a uniform observe/check/act interface over
//! heterogeneous distributed systems, plus the per-subject adapters that
//! implement it.
//!
//! The monitor and the evaluation harness both talk to a subject only
//! through the [`Subject`] trait; invariant semantics live in the
//! subject-specific [`InvariantChecker`] built by the same factory.

pub mod adapters;
pub mod checker;
pub mod clients;
pub mod error;
pub mod registry;
pub mod retry;
pub mod subject;

pub use adapters::builtin_registry;
pub use checker::{InvariantChecker, standard, standard_invariants};
pub use clients::{ControlPlaneClient, PrometheusClient};
pub use error::{ActionError, CheckError, ObserveError, SubjectError};
pub use registry::{SubjectEndpoints, SubjectFactory, SubjectParts, SubjectRegistry};
pub use retry::RetryPolicy;
pub use subject::{Subject, observation_healthy};
