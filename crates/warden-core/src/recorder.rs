use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;
use warden_common::ProviderKind;
use warden_provider_core::{Event, EventHub, InteractionEvent, StreamAccumulator, Usage};
use warden_storage::{InteractionOutcome, InteractionRecord, Storage, UsageDelta};

use crate::toon::CompressionStats;

/// Everything known about a request when it finishes, however it finished.
#[derive(Debug, Clone)]
pub struct InteractionDraft {
    pub agent_id: Uuid,
    pub user_id: Option<String>,
    pub provider: ProviderKind,
    pub interaction_type: String,
    pub outcome: InteractionOutcome,
    pub request: JsonValue,
    pub processed_request: JsonValue,
    pub response: JsonValue,
    pub model: String,
    pub baseline_model: String,
    pub usage: Usage,
    pub compression: CompressionStats,
    /// Audit text of a tool refusal or a limit block.
    pub refusal: Option<String>,
    pub stop_reason: Option<String>,
    pub started: Instant,
}

/// Persists the single interaction row for a request and charges its cost
/// against the agent's limit. Failures are logged and swallowed.
#[derive(Clone)]
pub struct UsageRecorder {
    storage: Arc<dyn Storage>,
    events: EventHub,
}

impl UsageRecorder {
    pub fn new(storage: Arc<dyn Storage>, events: EventHub) -> Self {
        Self { storage, events }
    }

    pub async fn record(&self, draft: InteractionDraft) -> Uuid {
        let usage = draft.usage;
        let cost = self
            .price(&draft.model, usage, draft.provider)
            .await;
        let baseline_cost = if draft.baseline_model == draft.model {
            cost
        } else {
            self.price(&draft.baseline_model, usage, draft.provider).await
        };

        let record = InteractionRecord {
            id: Uuid::new_v4(),
            agent_id: draft.agent_id,
            user_id: draft.user_id,
            provider: draft.provider,
            interaction_type: draft.interaction_type,
            outcome: draft.outcome,
            request: draft.request,
            processed_request: draft.processed_request,
            response: draft.response,
            model: draft.model,
            baseline_model: draft.baseline_model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost,
            baseline_cost,
            toon_tokens_before: draft.compression.tokens_before,
            toon_tokens_after: draft.compression.tokens_after,
            toon_cost_savings: draft.compression.cost_savings,
            toon_skip_reason: draft
                .compression
                .skip_reason
                .map(|reason| reason.as_str().to_string()),
            refusal: draft.refusal,
            stop_reason: draft.stop_reason,
            duration_ms: draft.started.elapsed().as_millis() as u64,
            created_at: OffsetDateTime::now_utc(),
        };

        if let Err(err) = self.storage.create_interaction(&record).await {
            tracing::error!(interaction_id = %record.id, error = %err, "failed to persist interaction");
        }
        let delta = UsageDelta {
            cost: cost.unwrap_or(0.0),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        };
        if let Err(err) = self.storage.record_usage(record.agent_id, delta).await {
            tracing::error!(agent_id = %record.agent_id, error = %err, "failed to record usage");
        }

        tracing::info!(
            interaction_id = %record.id,
            outcome = record.outcome.as_str(),
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            "interaction recorded"
        );
        self.events
            .emit(Event::Interaction(InteractionEvent {
                at: SystemTime::now(),
                interaction_id: record.id.to_string(),
                agent_id: record.agent_id.to_string(),
                provider: record.provider.to_string(),
                outcome: record.outcome.as_str().to_string(),
                model: record.model.clone(),
                baseline_model: record.baseline_model.clone(),
                input_tokens: record.input_tokens,
                output_tokens: record.output_tokens,
                cost: record.cost,
                baseline_cost: record.baseline_cost,
            }))
            .await;
        record.id
    }

    async fn price(&self, model: &str, usage: Usage, provider: ProviderKind) -> Option<f64> {
        match self
            .storage
            .calculate_cost(model, usage.input_tokens, usage.output_tokens, provider)
            .await
        {
            Ok(cost) => cost,
            Err(err) => {
                tracing::warn!(model, error = %err, "cost calculation failed");
                None
            }
        }
    }
}

/// Stored response for a streamed request. Refused streams keep no tool calls.
pub fn stream_summary(acc: &StreamAccumulator, refusal: Option<&str>) -> JsonValue {
    let (text, tool_calls) = match refusal {
        Some(message) => {
            let mut text = acc.text.clone();
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(message);
            (text, JsonValue::Array(Vec::new()))
        }
        None => (
            acc.text.clone(),
            serde_json::to_value(&acc.tool_calls).unwrap_or_default(),
        ),
    };
    serde_json::json!({
        "stream": true,
        "id": acc.response_id,
        "model": acc.effective_model(),
        "text": text,
        "tool_calls": tool_calls,
        "stop_reason": acc.stop_reason,
        "usage": acc.usage,
    })
}

#[cfg(test)]
mod tests {
    use warden_storage::{
        InteractionStore, LimitService, MemoryStorage, ModelPricing, PricingStore,
    };

    use super::*;

    fn draft(agent_id: Uuid, model: &str, baseline: &str) -> InteractionDraft {
        InteractionDraft {
            agent_id,
            user_id: None,
            provider: ProviderKind::OpenAi,
            interaction_type: "openai:chatCompletions".into(),
            outcome: InteractionOutcome::Completed,
            request: serde_json::json!({"model": baseline}),
            processed_request: serde_json::json!({"model": model}),
            response: serde_json::json!({}),
            model: model.into(),
            baseline_model: baseline.into(),
            usage: Usage {
                input_tokens: 1_000,
                output_tokens: 500,
                ..Default::default()
            },
            compression: CompressionStats::default(),
            refusal: None,
            stop_reason: Some("stop".into()),
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn prices_actual_and_baseline_models_and_charges_the_agent() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .upsert_pricing(&ModelPricing {
                provider: ProviderKind::OpenAi,
                model: "big".into(),
                input_per_million: 10.0,
                output_per_million: 20.0,
            })
            .await
            .unwrap();
        storage
            .upsert_pricing(&ModelPricing {
                provider: ProviderKind::OpenAi,
                model: "small".into(),
                input_per_million: 1.0,
                output_per_million: 2.0,
            })
            .await
            .unwrap();
        storage.set_cost_limit(Uuid::nil(), Some(100.0)).await.unwrap();

        let recorder = UsageRecorder::new(storage.clone(), EventHub::default());
        recorder.record(draft(Uuid::nil(), "small", "big")).await;

        let rows = storage.list_interactions(Some(Uuid::nil())).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!((row.cost.unwrap() - 0.002).abs() < 1e-12);
        assert!((row.baseline_cost.unwrap() - 0.02).abs() < 1e-12);
        let limit = storage.agent_limit(Uuid::nil()).await.unwrap().unwrap();
        assert!((limit.cost_used - 0.002).abs() < 1e-12);
        assert_eq!(limit.input_tokens, 1_000);
    }

    #[tokio::test]
    async fn unknown_pricing_records_without_cost() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = UsageRecorder::new(storage.clone(), EventHub::default());
        recorder.record(draft(Uuid::nil(), "mystery", "mystery")).await;
        let rows = storage.list_interactions(None).await.unwrap();
        assert_eq!(rows[0].cost, None);
        assert_eq!(rows[0].input_tokens, 1_000);
    }

    #[test]
    fn refused_summary_drops_tool_calls() {
        let mut acc = StreamAccumulator::new("gpt-4o");
        acc.start_tool_call(0, "call_1".into(), "read_file".into());
        acc.text.push_str("partial");
        let summary = stream_summary(&acc, Some("The tool call was blocked by a security policy."));
        assert_eq!(summary["tool_calls"], serde_json::json!([]));
        assert_eq!(
            summary["text"],
            "partial\n\nThe tool call was blocked by a security policy."
        );
        let plain = stream_summary(&acc, None);
        assert_eq!(plain["tool_calls"][0]["name"], "read_file");
        assert_eq!(plain["text"], "partial");
    }
}
