use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::checker::InvariantChecker;
use crate::error::SubjectError;
use crate::subject::Subject;

/// Connection endpoints handed to a subject factory.
///
/// Each adapter picks the fields it needs; unused fields stay `None`.
#[derive(Debug, Clone, Default)]
pub struct SubjectEndpoints {
    /// Control-plane HTTP base URL.
    pub control_plane_url: Option<String>,
    /// Prometheus-compatible metrics base URL.
    pub metrics_url: Option<String>,
    /// State backend URL (e.g. `redis://…`).
    pub state_backend_url: Option<String>,
    /// Container-name prefix for this subject's data-path containers.
    pub container_prefix: Option<String>,
}

impl SubjectEndpoints {
    pub fn control_plane(&self) -> Result<&str, SubjectError> {
        self.control_plane_url.as_deref().ok_or_else(|| {
            SubjectError::Configuration("control_plane_url is required".to_owned())
        })
    }
}

/// A constructed subject: the adapter and its companion checker.
pub type SubjectParts = (Arc<dyn Subject>, Arc<dyn InvariantChecker>);

type FactoryFuture = Pin<Box<dyn Future<Output = Result<SubjectParts, SubjectError>> + Send>>;

/// Async constructor for one subject kind.
pub type SubjectFactory = Arc<dyn Fn(SubjectEndpoints) -> FactoryFuture + Send + Sync>;

/// Maps subject names to factories. Factories are registered eagerly but
/// adapters (and their network clients) are only built on first `create`,
/// keeping startup cheap.
#[derive(Default, Clone)]
pub struct SubjectRegistry {
    factories: HashMap<String, SubjectFactory>,
}

impl SubjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: SubjectFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// The registered subject names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct the named subject and its checker.
    pub async fn create(
        &self,
        name: &str,
        endpoints: SubjectEndpoints,
    ) -> Result<SubjectParts, SubjectError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SubjectError::UnknownSubject(name.to_owned()))?;
        debug!(subject = name, "constructing subject adapter");
        factory(endpoints).await
    }
}
