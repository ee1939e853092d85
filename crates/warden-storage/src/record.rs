use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;
use warden_common::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Completed,
    /// Tool calls were blocked and replaced by refusal text.
    Refused,
    /// The stream ended early: caller disconnect or cancellation.
    Aborted,
    /// The upstream call failed.
    Errored,
}

impl InteractionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionOutcome::Completed => "completed",
            InteractionOutcome::Refused => "refused",
            InteractionOutcome::Aborted => "aborted",
            InteractionOutcome::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            InteractionOutcome::Completed,
            InteractionOutcome::Refused,
            InteractionOutcome::Aborted,
            InteractionOutcome::Errored,
        ]
        .into_iter()
        .find(|outcome| outcome.as_str() == value)
    }
}

/// Audit row written once per authenticated completion request. Never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Option<String>,
    pub provider: ProviderKind,
    /// e.g. `anthropic:messages`.
    pub interaction_type: String,
    pub outcome: InteractionOutcome,
    pub request: JsonValue,
    pub processed_request: JsonValue,
    pub response: JsonValue,
    pub model: String,
    pub baseline_model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Option<f64>,
    pub baseline_cost: Option<f64>,
    pub toon_tokens_before: u64,
    pub toon_tokens_after: u64,
    pub toon_cost_savings: Option<f64>,
    pub toon_skip_reason: Option<String>,
    pub refusal: Option<String>,
    pub stop_reason: Option<String>,
    pub duration_ms: u64,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_names_roundtrip() {
        for outcome in [
            InteractionOutcome::Completed,
            InteractionOutcome::Refused,
            InteractionOutcome::Aborted,
            InteractionOutcome::Errored,
        ] {
            assert_eq!(InteractionOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(InteractionOutcome::parse("done"), None);
    }
}
