use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

pub const REASON_OPERATOR_RUNNING: &str = "OperatorRunning";
pub const REASON_RECONCILE_COMPLETE: &str = "ReconcileComplete";
pub const REASON_CREATE_IN_PROGRESS: &str = "CreateInProgress";
pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_CREATE_FAILED: &str = "CreateFailed";
pub const REASON_UPDATE_FAILED: &str = "UpdateFailed";
pub const REASON_IMMUTABLE_ROLE_REF: &str = "ImmutableRoleRefChanged";

/// Outcome of one reconcile invocation, as reflected into the three status
/// conditions. Only these combinations are ever produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The binding matches the desired projection (no-op, or a create/update
    /// that just succeeded).
    Settled,
    /// No binding was found; creation is about to be attempted.
    CreateInProgress,
    /// Creating the binding failed, usually because the referenced role does
    /// not exist yet.
    FailedCreate,
    /// The immutable role reference was changed in the spec; the binding is
    /// frozen until an operator resolves the drift.
    DegradedImmutable,
    /// Rewriting the binding subjects failed.
    FailedUpdate,
}

impl ReconcileOutcome {
    /// The full condition set for this outcome. Available is True in every
    /// outcome: it models operator liveness, not binding health.
    pub fn conditions(&self, kind: &str, now: &Time) -> Vec<Condition> {
        let available = condition(
            CONDITION_AVAILABLE,
            "True",
            REASON_OPERATOR_RUNNING,
            "Permissions operator is available".to_string(),
            now,
        );
        let progressing_false = condition(
            CONDITION_PROGRESSING,
            "False",
            REASON_RECONCILE_COMPLETE,
            format!("No {} tasks are progressing", kind),
            now,
        );
        let degraded_false = condition(
            CONDITION_DEGRADED,
            "False",
            REASON_AS_EXPECTED,
            format!("No {} tasks are degraded", kind),
            now,
        );
        let (progressing, degraded) = match self {
            ReconcileOutcome::Settled => (progressing_false, degraded_false),
            ReconcileOutcome::CreateInProgress => (
                condition(
                    CONDITION_PROGRESSING,
                    "True",
                    REASON_CREATE_IN_PROGRESS,
                    format!("Creating the binding for {}", kind),
                    now,
                ),
                degraded_false,
            ),
            ReconcileOutcome::FailedCreate => (
                progressing_false,
                condition(
                    CONDITION_DEGRADED,
                    "True",
                    REASON_CREATE_FAILED,
                    format!(
                        "Failed to create the binding for {}, check that the referenced role exists",
                        kind
                    ),
                    now,
                ),
            ),
            ReconcileOutcome::DegradedImmutable => (
                progressing_false,
                condition(
                    CONDITION_DEGRADED,
                    "True",
                    REASON_IMMUTABLE_ROLE_REF,
                    format!(
                        "Immutable role reference changed for {}, binding left untouched",
                        kind
                    ),
                    now,
                ),
            ),
            ReconcileOutcome::FailedUpdate => (
                progressing_false,
                condition(
                    CONDITION_DEGRADED,
                    "True",
                    REASON_UPDATE_FAILED,
                    format!("Failed to update the binding subjects for {}", kind),
                    now,
                ),
            ),
        };
        vec![available, progressing, degraded]
    }
}

fn condition(type_: &str, status: &str, reason: &str, message: String, now: &Time) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: now.clone(),
        observed_generation: None,
    }
}

/// Upserts a condition by type: replace if present, append if absent, never a
/// duplicate type. The transition time of an existing condition is kept
/// unless its status value actually changed.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            let last_transition_time = if existing.status == new.status {
                existing.last_transition_time.clone()
            } else {
                new.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}
