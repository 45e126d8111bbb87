//! Concrete subject adapters.

pub mod kvstore;
pub mod mock;
pub mod ratelimiter;

use std::sync::Arc;

use crate::checker::InvariantChecker;
use crate::registry::{SubjectFactory, SubjectRegistry};
use crate::subject::Subject;

/// A registry pre-loaded with every built-in adapter.
#[must_use]
pub fn builtin_registry() -> SubjectRegistry {
    let mut registry = SubjectRegistry::new();
    let ratelimiter: SubjectFactory =
        Arc::new(|endpoints| Box::pin(ratelimiter::make_subject(endpoints)));
    registry.register("ratelimiter", ratelimiter);

    let kvstore: SubjectFactory = Arc::new(|endpoints| Box::pin(kvstore::make_subject(endpoints)));
    registry.register("kvstore", kvstore);

    let mock: SubjectFactory = Arc::new(|_endpoints| {
        Box::pin(async {
            let (subject, checker) = mock::MockSubject::healthy(3);
            let subject: Arc<dyn Subject> = subject;
            let checker: Arc<dyn InvariantChecker> = checker;
            Ok((subject, checker))
        })
    });
    registry.register("mock", mock);
    registry
}
