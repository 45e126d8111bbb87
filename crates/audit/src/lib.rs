//! Append-only session audit trail.
//!
//! Every agent session writes its conversation, tool calls, and tool
//! results here before anything else happens with them; an audit write
//! failure terminates the session. Payloads are redacted on the way in,
//! never at read time.

pub mod error;
pub mod record;
pub mod redact;
pub mod store;

pub use error::AuditError;
pub use record::{AuditEntry, AuditSession, EntryKind, EntryRole, session_id};
pub use redact::Redactor;
pub use store::AuditStore;
