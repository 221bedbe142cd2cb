//! The upstream side of the proxy.
//!
//! [`UpstreamAdapter`] owns the single backend connection shared by the whole
//! process. A [`Connector`] creates that connection lazily; the connection
//! itself is a [`BackendConnection`] that accepts one flattened text context
//! per exchange and replies with a sequence of [`BackendEvent`]s.
//!
//! The connection is guarded by an async mutex that is held for the whole
//! send-then-receive-until-finish span of an exchange, so concurrent requests
//! are served one after another and never read each other's replies.

pub mod iflow;

use crate::error::{ProxyError, Result};
use crate::translate::openai_types::ChatMessage;

use async_trait::async_trait;
use futures::stream::Stream;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One event read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A piece of assistant text. May be empty.
    Content(String),
    /// End of the assistant turn.
    Finish,
}

#[async_trait]
pub trait BackendConnection: Send {
    /// Submit one flattened context as a single outbound message.
    async fn send(&mut self, text: &str) -> Result<()>;

    /// Read the next event of the reply to the last `send`. `None` means the
    /// backend ended the reply without an explicit finish event.
    async fn recv(&mut self) -> Result<Option<BackendEvent>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>>;
}

type ConnectionSlot = Arc<Mutex<Option<Box<dyn BackendConnection>>>>;

pub struct UpstreamAdapter {
    connector: Arc<dyn Connector>,
    connection: ConnectionSlot,
}

impl UpstreamAdapter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the shared connection. Calling this while already connected is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            tracing::info!("Opening upstream connection");
            *slot = Some(self.connector.connect().await?);
            tracing::info!("Upstream connection ready");
        }
        Ok(())
    }

    /// Close the shared connection if one is open.
    pub async fn close(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(mut conn) = slot.take() {
            tracing::info!("Closing upstream connection");
            conn.close().await?;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Send `messages` upstream and stream the reply back as text fragments.
    ///
    /// Nothing happens until the returned stream is polled. Empty fragments are
    /// dropped. A failure is yielded once as [`ProxyError::Upstream`] and ends
    /// the stream. Dropping the stream abandons the reply and releases the
    /// connection.
    pub fn exchange(
        &self,
        messages: Vec<ChatMessage>,
    ) -> impl Stream<Item = Result<String>> + Send + 'static {
        let connector = Arc::clone(&self.connector);
        let slot = Arc::clone(&self.connection);

        async_stream::try_stream! {
            let mut guard = slot.lock_owned().await;
            if guard.is_none() {
                tracing::info!("Opening upstream connection");
                *guard = Some(connector.connect().await.map_err(upstream_failure)?);
            }
            let conn = guard
                .as_mut()
                .ok_or_else(|| ProxyError::upstream("connection unavailable"))?;

            let context = flatten_context(&messages);
            tracing::debug!(messages = messages.len(), context_len = context.len(), "Sending context upstream");
            conn.send(&context).await.map_err(upstream_failure)?;

            loop {
                match conn.recv().await.map_err(upstream_failure)? {
                    Some(BackendEvent::Content(text)) => {
                        if !text.is_empty() {
                            yield text;
                        }
                    }
                    Some(BackendEvent::Finish) | None => break,
                }
            }
        }
    }
}

/// Concatenate every message's content in order, each followed by a blank
/// line. Roles are not carried over.
pub fn flatten_context(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}\n\n", m.content))
        .collect()
}

fn upstream_failure(e: ProxyError) -> ProxyError {
    tracing::warn!(error = %e, "Upstream call failed");
    match e {
        ProxyError::Upstream { .. } => e,
        other => ProxyError::upstream(other.to_string()),
    }
}
