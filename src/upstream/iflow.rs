//! iFlow backend reached over its OpenAI-compatible HTTP API.
//!
//! The long-lived handle is a `reqwest::Client`. Each `send` posts the
//! flattened context as one user message with `stream: true`; `recv` decodes
//! the SSE reply with `eventsource-stream` and turns it into [`BackendEvent`]s.

use super::{BackendConnection, BackendEvent, Connector};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{Stream, StreamExt};
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

type EventStream = Pin<
    Box<
        dyn Stream<Item = std::result::Result<eventsource_stream::Event, EventStreamError<reqwest::Error>>>
            + Send,
    >,
>;

#[derive(Debug, Clone)]
pub struct IflowSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl IflowSettings {
    /// Build settings from the `[upstream]` section, resolving the API key.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.upstream.base_url.clone(),
            api_key: config.resolve_api_key()?,
            model: config.upstream.model.clone(),
            user_agent: config.upstream.user_agent.clone(),
            timeout: config.upstream_timeout(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

pub struct IflowConnector {
    settings: IflowSettings,
}

impl IflowConnector {
    pub fn new(settings: IflowSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for IflowConnector {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>> {
        let client = reqwest::Client::builder()
            .timeout(self.settings.timeout)
            .build()?;

        tracing::info!(
            base_url = %self.settings.base_url,
            model = %self.settings.model,
            "iFlow client ready"
        );

        Ok(Box::new(IflowConnection {
            client,
            settings: self.settings.clone(),
            events: None,
            finish_pending: false,
        }))
    }
}

pub struct IflowConnection {
    client: reqwest::Client,
    settings: IflowSettings,
    events: Option<EventStream>,
    finish_pending: bool,
}

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: [UpstreamMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct UpstreamMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    error: Option<UpstreamError>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: UpstreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// Thinking models stream their reasoning here.
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl BackendConnection for IflowConnection {
    async fn send(&mut self, text: &str) -> Result<()> {
        // Leftovers from an abandoned exchange must not leak into this one.
        self.events = None;
        self.finish_pending = false;

        let url = self.settings.completions_url();
        let body = UpstreamRequest {
            model: &self.settings.model,
            messages: [UpstreamMessage {
                role: "user",
                content: text,
            }],
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .header(USER_AGENT, &self.settings.user_agent)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::upstream(format!(
                "iFlow returned status {}: {}",
                status.as_u16(),
                truncate(&body, 500)
            )));
        }

        self.events = Some(Box::pin(response.bytes_stream().eventsource()));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<BackendEvent>> {
        if self.finish_pending {
            self.finish_pending = false;
            self.events = None;
            return Ok(Some(BackendEvent::Finish));
        }

        loop {
            let next = match self.events.as_mut() {
                Some(events) => events.next().await,
                None => return Err(ProxyError::other("recv called without a pending reply")),
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    self.events = None;
                    return Err(ProxyError::upstream(format!("Reply stream broken: {}", e)));
                }
                None => {
                    self.events = None;
                    return Ok(None);
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.events = None;
                return Ok(Some(BackendEvent::Finish));
            }

            let chunk: UpstreamChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unparseable upstream event");
                    continue;
                }
            };

            if let Some(err) = chunk.error {
                self.events = None;
                return Err(ProxyError::upstream(format!(
                    "iFlow reported an error: {}",
                    err.message.unwrap_or_else(|| "unknown error".to_string())
                )));
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            let text = choice
                .delta
                .content
                .filter(|s| !s.is_empty())
                .or_else(|| choice.delta.reasoning_content.filter(|s| !s.is_empty()))
                .unwrap_or_default();

            if choice.finish_reason.is_some() {
                if text.is_empty() {
                    self.events = None;
                    return Ok(Some(BackendEvent::Finish));
                }
                self.finish_pending = true;
            }

            if !text.is_empty() {
                return Ok(Some(BackendEvent::Content(text)));
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.events = None;
        self.finish_pending = false;
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
