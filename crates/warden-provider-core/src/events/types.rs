use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Headers;
use crate::provider::UpstreamTransportErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Upstream(UpstreamEvent),
    AuthFailure(AuthFailureEvent),
    Interaction(InteractionEvent),
}

/// One upstream call, completion or passthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub trace_id: Option<String>,
    pub at: SystemTime,
    pub provider: String,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub request_method: String,
    pub request_url: String,
    pub request_headers: Headers,
    pub stream: bool,
    pub response_status: Option<u16>,
    /// `completed`, `client_disconnected`, `upstream_error` or `cancelled` for streams.
    pub termination: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub transport_kind: Option<UpstreamTransportErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailureEvent {
    pub at: SystemTime,
    pub provider: String,
    pub source_ip: Option<String>,
    pub reason: String,
    pub locked_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub at: SystemTime,
    pub interaction_id: String,
    pub agent_id: String,
    pub provider: String,
    pub outcome: String,
    pub model: String,
    pub baseline_model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Option<f64>,
    pub baseline_cost: Option<f64>,
}
