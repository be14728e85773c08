//! Chunk encoder.
//!
//! Turns [`OutputDelta`] values into `data: <json>\n\n` frames. Every frame of
//! one session shares the completion id, creation timestamp and model fixed
//! when the encoder is built.

use crate::types::{
    new_completion_id, unix_now, ChatCompletionChunk, ChatRole, ChunkChoice, ChunkDelta,
    CHUNK_OBJECT, DONE_FRAME,
};
use futures::{Stream, StreamExt};

/// What the relay emits to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDelta {
    Role,
    Content(String),
    Stop,
}

impl OutputDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    pub fn as_content(&self) -> Option<&str> {
        match self {
            Self::Content(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    completion_id: String,
    created: i64,
    model: String,
}

impl ChunkEncoder {
    pub fn new(completion_id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            completion_id: completion_id.into(),
            created,
            model: model.into(),
        }
    }

    /// Fresh id, current time.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self::new(new_completion_id(), unix_now(), model)
    }

    pub fn completion_id(&self) -> &str {
        &self.completion_id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the chunk for a delta.
    pub fn chunk(&self, delta: &OutputDelta) -> ChatCompletionChunk {
        let (delta, finish_reason) = match delta {
            OutputDelta::Role => (
                ChunkDelta {
                    role: Some(ChatRole::Assistant),
                    content: Some(String::new()),
                },
                None,
            ),
            OutputDelta::Content(text) => (
                ChunkDelta {
                    role: None,
                    content: Some(text.clone()),
                },
                None,
            ),
            OutputDelta::Stop => (ChunkDelta::default(), Some("stop".to_string())),
        };

        ChatCompletionChunk {
            id: self.completion_id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Encode a delta as wire frames. `Stop` also carries the terminator.
    pub fn encode(&self, delta: &OutputDelta) -> String {
        let frame = sse_frame(&self.chunk(delta));
        if matches!(delta, OutputDelta::Stop) {
            format!("{}{}", frame, DONE_FRAME)
        } else {
            frame
        }
    }
}

/// Encode every delta of `deltas` with `encoder`.
pub fn encode_stream<S>(encoder: ChunkEncoder, deltas: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = OutputDelta> + Send,
{
    deltas.map(move |delta| encoder.encode(&delta))
}

fn sse_frame(chunk: &ChatCompletionChunk) -> String {
    // Serializing plain structs of strings and integers cannot fail.
    let json = serde_json::to_string(chunk).unwrap_or_default();
    format!("data: {}\n\n", json)
}
