//! Translation of upstream text fragments into OpenAI SSE chunks.
//!
//! A [`StreamTranslator`] is created once per request. It fixes the request id
//! and `created` timestamp so every chunk of one stream carries the same
//! values, and it knows how to frame chunks as Server-Sent-Events.
//! [`translate_fragments`] drives an upstream fragment stream through it.

use super::openai_types::{
    has_user_message, ChatMessage, ChunkChoice, ChunkDelta, FinishReason, StreamChunk,
    CHUNK_OBJECT,
};
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

/// The sentinel frame that closes every stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Generate an OpenAI-style completion id: `chatcmpl-` plus 24 hex chars.
pub fn new_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..24])
}

/// Frame one chunk as a `data: <json>\n\n` SSE event.
pub fn sse_frame(chunk: &StreamChunk) -> String {
    match serde_json::to_string(chunk) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(e) => {
            tracing::error!(id = %chunk.id, error = %e, "Failed to serialize chunk");
            String::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamTranslator {
    id: String,
    created: i64,
    model: String,
}

impl StreamTranslator {
    /// Captures the current unix timestamp as `created`.
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_created(id, model, chrono::Utc::now().timestamp())
    }

    pub fn with_created(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
            model: model.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content_chunk(&self, text: &str) -> StreamChunk {
        self.chunk(vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: Some(text.to_string()),
            },
            finish_reason: None,
        }])
    }

    pub fn stop_chunk(&self) -> StreamChunk {
        self.chunk(vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { content: None },
            finish_reason: Some(FinishReason::Stop),
        }])
    }

    /// Errors are signalled in-band by a chunk with no choices at all.
    pub fn error_chunk(&self) -> StreamChunk {
        self.chunk(Vec::new())
    }

    fn chunk(&self, choices: Vec<ChunkChoice>) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
        }
    }
}

/// Drive a fragment stream into SSE frames.
///
/// `exchange` is invoked lazily, only after the user-message check passes, so
/// a request without a user message never reaches the backend. Whatever
/// happens, the stream ends with exactly one terminal chunk followed by
/// [`DONE_FRAME`]. Errors are logged and surfaced as an empty-choices chunk.
pub fn translate_fragments<F, S>(
    translator: StreamTranslator,
    messages: Vec<ChatMessage>,
    exchange: F,
    logger: SharedLogger,
) -> impl Stream<Item = Bytes> + Send + 'static
where
    F: FnOnce(Vec<ChatMessage>) -> S + Send + 'static,
    S: Stream<Item = Result<String>> + Send + 'static,
{
    async_stream::stream! {
        let mut failure: Option<ProxyError> = None;
        let mut emitted = 0usize;

        if has_user_message(&messages) {
            let fragments = exchange(messages);
            futures::pin_mut!(fragments);

            while let Some(item) = fragments.next().await {
                match item {
                    Ok(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        emitted += 1;
                        yield Bytes::from(sse_frame(&translator.content_chunk(&text)));
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        } else {
            failure = Some(ProxyError::other("No user message found"));
        }

        match failure {
            None => {
                tracing::debug!(id = %translator.id(), chunks = emitted, "Stream completed");
                logger.info_for(
                    "stream",
                    translator.id(),
                    format!("Stream completed chunks={}", emitted),
                );
                yield Bytes::from(sse_frame(&translator.stop_chunk()));
            }
            Some(e) => {
                tracing::error!(id = %translator.id(), error = %e, "Stream failed");
                logger.error_for(
                    "stream",
                    translator.id(),
                    format!("Stream failed after {} chunks: {}", emitted, e),
                );
                yield Bytes::from(sse_frame(&translator.error_chunk()));
            }
        }

        yield Bytes::from_static(DONE_FRAME.as_bytes());
    }
}
