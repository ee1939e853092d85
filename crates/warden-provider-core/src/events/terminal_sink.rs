use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink};
use crate::headers::redact_headers;

/// Prints one JSON line per event on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalEventSink {
    redact_sensitive: bool,
}

impl TerminalEventSink {
    pub fn new(redact_sensitive: bool) -> Self {
        Self { redact_sensitive }
    }

    fn prepare(&self, event: &Event) -> Event {
        let mut event = event.clone();
        if self.redact_sensitive
            && let Event::Upstream(upstream) = &mut event
        {
            upstream.request_headers = redact_headers(&upstream.request_headers);
        }
        event
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let event = self.prepare(event);
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{line}"),
                Err(err) => {
                    eprintln!("{{\"event\":\"event_serialize_error\",\"error\":\"{err}\"}}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::events::UpstreamEvent;
    use crate::headers::header_get;

    #[test]
    fn redacts_credentials_in_upstream_events() {
        let event = Event::Upstream(UpstreamEvent {
            trace_id: None,
            at: SystemTime::now(),
            provider: "anthropic".into(),
            agent_id: None,
            model: Some("claude".into()),
            request_method: "POST".into(),
            request_url: "https://api.anthropic.com/v1/messages".into(),
            request_headers: vec![("x-api-key".into(), "sk-ant".into())],
            stream: false,
            response_status: Some(200),
            termination: None,
            input_tokens: None,
            output_tokens: None,
            duration_ms: 1,
            error_message: None,
            transport_kind: None,
        });
        let Event::Upstream(prepared) = TerminalEventSink::new(true).prepare(&event) else {
            panic!("kind changed");
        };
        assert_eq!(header_get(&prepared.request_headers, "x-api-key"), Some("***"));
    }
}
