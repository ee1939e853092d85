use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use super::types::Event;

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Fan-out point for structured events: broadcast subscribers plus sinks.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    /// Never blocks on sinks; each write runs on its own task.
    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::events::AuthFailureEvent;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.emit(Event::AuthFailure(AuthFailureEvent {
            at: SystemTime::now(),
            provider: "openai".into(),
            source_ip: Some("10.0.0.1".into()),
            reason: "invalid virtual key".into(),
            locked_out: false,
        }))
        .await;
        match rx.recv().await.unwrap() {
            Event::AuthFailure(event) => assert_eq!(event.provider, "openai"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
