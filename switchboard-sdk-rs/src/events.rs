use crate::error::ErrorKind;
use crate::session::StateValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Agent id used for events the runner emits itself.
pub const RUNNER_ID: &str = "runner";

/// One observable step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sequence: u64,
    pub agent_id: String,
    /// Delegation depth of the emitting agent; 0 is the root agent.
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    PartialOutput {
        text: String,
    },
    ToolCall {
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_name: String,
        result: String,
    },
    Delegation {
        delegated_to: String,
    },
    /// `value` is `None` when the key was removed.
    StateWrite {
        key: String,
        value: Option<StateValue>,
    },
    FinalResult {
        result: String,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
        origin: String,
    },
    Cancelled {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PartialOutput,
    ToolCall,
    ToolResult,
    Delegation,
    StateWrite,
    FinalResult,
    Error,
    Cancelled,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PartialOutput { .. } => EventKind::PartialOutput,
            EventPayload::ToolCall { .. } => EventKind::ToolCall,
            EventPayload::ToolResult { .. } => EventKind::ToolResult,
            EventPayload::Delegation { .. } => EventKind::Delegation,
            EventPayload::StateWrite { .. } => EventKind::StateWrite,
            EventPayload::FinalResult { .. } => EventKind::FinalResult,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Cancelled { .. } => EventKind::Cancelled,
        }
    }
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::FinalResult | EventKind::Error | EventKind::Cancelled
        )
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Terminal for the whole run, as opposed to a delegated agent finishing.
    pub fn is_run_terminal(&self) -> bool {
        self.depth == 0 && self.kind().is_terminal()
    }
}

/// Numbers events and forwards them to the caller's stream.
///
/// Numbering and sending happen under one lock, so the channel order equals
/// the sequence order even when several sub-agents emit concurrently. Once the
/// run is cancelled every emission is dropped; only the runner's own
/// cancellation notice still goes through.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    tx: mpsc::Sender<Event>,
    last_sequence: Mutex<u64>,
    cancel: CancellationToken,
    stream_tool_results: bool,
    run_terminal_sent: AtomicBool,
}

impl EventSink {
    pub fn channel(
        buffer: usize,
        cancel: CancellationToken,
        stream_tool_results: bool,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let sink = Self {
            inner: Arc::new(SinkInner {
                tx,
                last_sequence: Mutex::new(0),
                cancel,
                stream_tool_results,
                run_terminal_sent: AtomicBool::new(false),
            }),
        };
        (sink, rx)
    }

    /// Returns the assigned sequence number, or `None` if the event was
    /// filtered out or the run no longer accepts events.
    pub async fn emit(&self, agent_id: &str, depth: u32, payload: EventPayload) -> Option<u64> {
        if payload.kind() == EventKind::ToolResult && !self.inner.stream_tool_results {
            return None;
        }
        let mut last = self.inner.last_sequence.lock().await;
        if self.inner.cancel.is_cancelled() {
            return None;
        }
        let event = self.build(*last + 1, agent_id, depth, payload);
        let terminal = event.is_run_terminal();
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            sent = self.inner.tx.send(event) => match sent {
                Ok(()) => {
                    *last += 1;
                    if terminal {
                        self.inner.run_terminal_sent.store(true, Ordering::SeqCst);
                    }
                    Some(*last)
                }
                Err(_) => {
                    tracing::debug!("event receiver dropped, cancelling run");
                    self.inner.cancel.cancel();
                    None
                }
            },
        }
    }

    /// Emits the single cancellation notice, bypassing the cancelled check.
    pub async fn emit_cancellation(&self, reason: &str) -> Option<u64> {
        let mut last = self.inner.last_sequence.lock().await;
        let event = self.build(
            *last + 1,
            RUNNER_ID,
            0,
            EventPayload::Cancelled {
                reason: reason.to_string(),
            },
        );
        match self.inner.tx.send(event).await {
            Ok(()) => {
                *last += 1;
                self.inner.run_terminal_sent.store(true, Ordering::SeqCst);
                Some(*last)
            }
            Err(_) => None,
        }
    }

    pub fn run_terminal_sent(&self) -> bool {
        self.inner.run_terminal_sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    fn build(&self, sequence: u64, agent_id: &str, depth: u32, payload: EventPayload) -> Event {
        Event {
            sequence,
            agent_id: agent_id.to_string(),
            depth,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequences_strictly_increase() {
        let (sink, mut rx) = EventSink::channel(8, CancellationToken::new(), false);
        for i in 0..3 {
            let seq = sink
                .emit(
                    "weather_agent",
                    1,
                    EventPayload::PartialOutput {
                        text: format!("chunk {}", i),
                    },
                )
                .await;
            assert_eq!(seq, Some(i + 1));
        }
        drop(sink);
        let mut seen = vec![];
        while let Some(ev) = rx.recv().await {
            seen.push(ev.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tool_results_filtered_by_default() {
        let (sink, _rx) = EventSink::channel(8, CancellationToken::new(), false);
        let payload = EventPayload::ToolResult {
            tool_name: "searchFlights".into(),
            result: "NH 211".into(),
        };
        assert_eq!(sink.emit("travel_agent", 0, payload.clone()).await, None);

        let (sink, _rx) = EventSink::channel(8, CancellationToken::new(), true);
        assert_eq!(sink.emit("travel_agent", 0, payload).await, Some(1));
    }

    #[tokio::test]
    async fn test_cancelled_sink_only_passes_cancellation() {
        let cancel = CancellationToken::new();
        let (sink, mut rx) = EventSink::channel(8, cancel.clone(), false);
        sink.emit("a", 0, EventPayload::PartialOutput { text: "x".into() })
            .await;
        cancel.cancel();
        let dropped = sink
            .emit("a", 0, EventPayload::FinalResult { result: "y".into() })
            .await;
        assert_eq!(dropped, None);
        assert_eq!(sink.emit_cancellation("caller").await, Some(2));
        assert!(sink.run_terminal_sent());

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::PartialOutput);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.kind(), EventKind::Cancelled);
        assert_eq!(last.agent_id, RUNNER_ID);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels_run() {
        let cancel = CancellationToken::new();
        let (sink, rx) = EventSink::channel(1, cancel.clone(), false);
        drop(rx);
        let seq = sink
            .emit("a", 0, EventPayload::PartialOutput { text: "x".into() })
            .await;
        assert_eq!(seq, None);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_wire_shape() {
        let event = Event {
            sequence: 7,
            agent_id: "travel_agent".into(),
            depth: 0,
            timestamp: Utc::now(),
            payload: EventPayload::ToolCall {
                tool_name: "searchFlights".into(),
                arguments: json!({"dest": "Tokyo"}),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "tool_call");
        assert_eq!(value["agentId"], "travel_agent");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["payload"]["toolName"], "searchFlights");
        assert_eq!(value["payload"]["arguments"]["dest"], "Tokyo");

        let err = EventPayload::Error {
            error_kind: ErrorKind::ToolFailure,
            message: "boom".into(),
            origin: "travel_agent".into(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["payload"]["errorKind"], "toolFailure");
    }
}
