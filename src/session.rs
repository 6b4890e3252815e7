//! Streaming conversational sessions over the query engine.
//!
//! A session owns an append-only message history and runs one turn at a
//! time: Idle → Streaming → Committed → Idle. Deltas flow to the caller over
//! a bounded channel; the request/response pair is appended to history in a
//! single write only after the stream finishes, so cancelling mid-turn never
//! leaves a partial entry behind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::engine::{HybridQueryEngine, QueryMode};
use crate::status::{JobOutcome, PipelineStatusCoordinator};
use crate::types::RagError;

/// One component of a conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum MessagePart {
    SystemPrompt { content: String },
    UserPrompt { content: String },
    Text { content: String },
    ToolCall { name: String, arguments: serde_json::Value },
    ToolReturn { name: String, value: serde_json::Value },
}

/// Direction of a message within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

/// A conversation turn half: an ordered sequence of parts.
///
/// Only final assembled text is ever stored; streaming deltas never reach
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
    pub when: DateTime<Utc>,
}

impl Message {
    pub fn request(user_input: &str) -> Self {
        Self {
            kind: MessageKind::Request,
            parts: vec![MessagePart::UserPrompt {
                content: user_input.to_string(),
            }],
            when: Utc::now(),
        }
    }

    pub fn response(text: &str) -> Self {
        Self {
            kind: MessageKind::Response,
            parts: vec![MessagePart::Text {
                content: text.to_string(),
            }],
            when: Utc::now(),
        }
    }

    /// Concatenated text-bearing parts, for re-display.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::SystemPrompt { content }
                | MessagePart::UserPrompt { content }
                | MessagePart::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Append-only conversation history; readers get point-in-time snapshots.
#[derive(Clone, Default)]
pub struct SessionHistory {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completed turn (request and response) in one write, so a
    /// concurrent reader sees either both messages or neither.
    pub fn append_turn(&self, request: Message, response: Message) {
        let mut messages = self.messages.write();
        messages.push(request);
        messages.push(response);
    }

    /// Snapshot of the full history, for client re-display on reconnect.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

/// Per-turn lifecycle, observable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
}

/// Events delivered to the client during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A fragment of the response text, in order.
    Delta(String),
    /// Terminal: the turn completed and was committed to history.
    End { text: String, sources: Vec<String> },
    /// Terminal: the turn failed; history was not touched.
    Error(String),
}

/// Receiving side of one turn's event stream.
///
/// Dropping the stream before `End` cancels the turn: the producer observes
/// the closed channel, stops, and commits nothing.
pub struct TurnStream {
    events: flume::Receiver<TurnEvent>,
}

impl TurnStream {
    /// Next event, or `None` once the stream is exhausted.
    pub async fn next(&self) -> Option<TurnEvent> {
        self.events.recv_async().await.ok()
    }

    /// Collects the remaining deltas into the final text. Returns an error
    /// event's message as `Err`.
    pub async fn collect_text(self) -> Result<String, RagError> {
        let mut assembled = String::new();
        while let Some(event) = self.next().await {
            match event {
                TurnEvent::Delta(delta) => assembled.push_str(&delta),
                TurnEvent::End { text, .. } => return Ok(text),
                TurnEvent::Error(message) => return Err(RagError::Query(message)),
            }
        }
        Ok(assembled)
    }

    /// Abandons the turn without consuming further events.
    pub fn cancel(self) {
        drop(self.events);
    }
}

/// Drives streaming turns against the query engine and maintains history.
///
/// One turn at a time: starting a turn while another is streaming is an
/// error, which keeps history append order equal to turn-completion order.
pub struct StreamingSession {
    engine: Arc<HybridQueryEngine>,
    history: SessionHistory,
    coordinator: PipelineStatusCoordinator,
    state: Arc<Mutex<TurnState>>,
    mode: QueryMode,
    delta_capacity: usize,
}

impl StreamingSession {
    pub fn new(
        engine: Arc<HybridQueryEngine>,
        coordinator: PipelineStatusCoordinator,
        mode: QueryMode,
        delta_capacity: usize,
    ) -> Self {
        Self {
            engine,
            history: SessionHistory::new(),
            coordinator,
            state: Arc::new(Mutex::new(TurnState::Idle)),
            mode,
            delta_capacity: delta_capacity.max(1),
        }
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    /// Starts a turn for the given user input and returns its event stream.
    ///
    /// The turn runs on a background task; it commits the request/response
    /// pair to history only after the last delta went out.
    pub fn send(&self, user_input: &str) -> Result<TurnStream, RagError> {
        {
            let mut state = self.state.lock();
            if *state == TurnState::Streaming {
                return Err(RagError::Query("a turn is already streaming".to_string()));
            }
            *state = TurnState::Streaming;
        }

        let (tx, rx) = flume::bounded(self.delta_capacity);
        let engine = Arc::clone(&self.engine);
        let history = self.history.clone();
        let state = Arc::clone(&self.state);
        let guard = self.coordinator.begin_job("query-turn");
        let mode = self.mode;
        let input = user_input.to_string();

        tokio::spawn(async move {
            // Whatever happens below, the session returns to Idle and the
            // job guard is released.
            let _reset = ResetState(state);
            let guard = guard;

            let stream = match engine.query_stream(&input, mode).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = tx.send_async(TurnEvent::Error(err.to_string())).await;
                    guard.finish(JobOutcome::Failed);
                    return;
                }
            };

            let mut assembled = String::new();
            loop {
                match stream.deltas.recv_async().await {
                    Ok(Ok(delta)) => {
                        assembled.push_str(&delta);
                        if tx.send_async(TurnEvent::Delta(delta)).await.is_err() {
                            // Client cancelled: no commit.
                            tracing::debug!("turn cancelled by client, discarding partial output");
                            return;
                        }
                    }
                    Ok(Err(err)) => {
                        let _ = tx.send_async(TurnEvent::Error(err.to_string())).await;
                        guard.finish(JobOutcome::Failed);
                        return;
                    }
                    // Channel closed: stream complete.
                    Err(_) => break,
                }
            }

            // Commit, then announce the end of the turn.
            history.append_turn(Message::request(&input), Message::response(&assembled));
            let _ = tx
                .send_async(TurnEvent::End {
                    text: assembled,
                    sources: stream.sources,
                })
                .await;
            guard.finish(JobOutcome::Completed);
        });

        Ok(TurnStream { events: rx })
    }
}

/// Puts the session back to `Idle` on every exit path of a turn task.
struct ResetState(Arc<Mutex<TurnState>>);

impl Drop for ResetState {
    fn drop(&mut self) {
        *self.0.lock() = TurnState::Idle;
    }
}
