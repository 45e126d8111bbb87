//! Initial-context assembly for agent sessions.

use std::fmt::Write;

use vigil_core::{ActionDefinition, SubjectConfig, Ticket};

/// System prompt for remediation sessions.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an SRE operator for a distributed system. You diagnose and remediate \
faults using the `shell` tool, which runs inside a sandbox container with \
docker CLI access to the subject's containers. Work incrementally: inspect \
before you mutate, prefer the least invasive remediation, and verify the fix \
before finishing. When the cluster is healthy again (or you are certain you \
cannot fix it), reply without calling any tool and state what you found.";

/// Render the initial user message from the open tickets, the latest
/// observation snapshot, and the subject's action catalog.
#[must_use]
pub fn build_initial_context(
    subject: &SubjectConfig,
    actions: &[ActionDefinition],
    tickets: &[Ticket],
    snapshot: Option<&serde_json::Value>,
) -> String {
    let mut out = format!("Subject: {}\n", subject.name);

    if tickets.is_empty() {
        out.push_str("\nNo open tickets.\n");
    } else {
        out.push_str("\nOpen tickets:\n");
        for ticket in tickets {
            let _ = writeln!(out, "  {}", ticket.render_line());
        }
    }

    if let Some(snapshot) = snapshot {
        let _ = writeln!(
            out,
            "\nLatest observation snapshot:\n{}",
            serde_json::to_string_pretty(snapshot).unwrap_or_default()
        );
    }

    if !actions.is_empty() {
        out.push_str("\nControl-plane actions this subject supports (for reference; \
                      invoke them via the subject's API or CLI from the shell):\n");
        for action in actions {
            let _ = writeln!(
                out,
                "  {} ({:?} risk): {}",
                action.name, action.risk, action.description
            );
        }
    }

    out.push_str("\nDiagnose the situation and remediate it.");
    out
}
