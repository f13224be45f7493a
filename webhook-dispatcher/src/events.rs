/// Subscribing to this name delivers every event.
pub const WILDCARD: &str = "*";

/// Event sent by `test_webhook`.
pub const HEALTH_CHECK: &str = "system.health_check";

/// Events the Nexus CRM services emit.
pub const KNOWN_EVENTS: &[&str] = &[
    "contact.created",
    "contact.updated",
    "contact.deleted",
    "deal.created",
    "deal.updated",
    "deal.stage_changed",
    "deal.won",
    "deal.lost",
    "message.received",
    "message.sent",
    "workflow.triggered",
    "workflow.completed",
    "workflow.failed",
    "payment.received",
    "payment.failed",
    "project.milestone_reached",
    "lead.scored",
    HEALTH_CHECK,
];

pub fn is_known(event: &str) -> bool {
    event == WILDCARD || KNOWN_EVENTS.contains(&event)
}
