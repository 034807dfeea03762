use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};

const RING_CAPACITY: usize = 500;

/// Mirrors tracing events onto the SSE log stream: every event becomes one
/// JSON line, broadcast to live subscribers and kept in a bounded replay
/// ring for clients that connect late.
pub(crate) struct LogStreamLayer {
    tx: broadcast::Sender<String>,
    ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl LogStreamLayer {
    pub(crate) fn new(
        tx: broadcast::Sender<String>,
        ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    ) -> Self {
        Self { tx, ring }
    }

    fn publish(&self, line: String) {
        let _ = self.tx.send(line.clone());
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line);
        }
    }
}

#[derive(Serialize)]
struct LogLine {
    ts: String,
    level: String,
    component: String,
    message: String,
}

struct MessageText(String);

impl Visit for MessageText {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            // Debug on a &str message wraps it in quotes.
            self.0 = format!("{value:?}").trim_matches('"').to_string();
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LogStreamLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let meta = event.metadata();
        if *meta.level() == tracing::Level::TRACE {
            return;
        }

        let mut text = MessageText(String::new());
        event.record(&mut text);

        // The last module-path segment names the emitting component
        // (engine, scheduler, polling, callback, service, an adapter, ...),
        // which is exactly the granularity the dashboard filters on.
        let component = meta
            .target()
            .rsplit("::")
            .next()
            .unwrap_or("server")
            .to_string();

        let line = LogLine {
            ts: chrono::Utc::now().to_rfc3339(),
            level: meta.level().to_string().to_ascii_lowercase(),
            component,
            message: text.0,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            self.publish(json);
        }
    }
}
