//! Chat-completion client for OpenAI-compatible endpoints.
//!
//! Streaming responses arrive as server-sent events. Network chunks don't line
//! up with event boundaries, so bytes are line-buffered before each `data:`
//! payload is parsed into a text fragment.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::pin::Pin;
use tracing::{debug, error, instrument, warn};

use crate::constants;
use crate::conversation::Message;
use crate::error::{CoachError, CoachResult};

/// Lazy, finite, non-restartable sequence of response text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = CoachResult<String>> + Send>>;

/// The seam between a session and whatever produces assistant text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_completion(&self, messages: &[Message]) -> CoachResult<FragmentStream>;
}

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl CompletionSettings {
    /// Resolves the key, endpoint and model once from the environment.
    pub fn from_env() -> CoachResult<Self> {
        let api_key = constants::OPENAI_API_KEY
            .clone()
            .ok_or(CoachError::MissingApiKey)?;
        Ok(Self {
            base_url: constants::OPENAI_BASE_URL.clone(),
            api_key,
            model: constants::FITCOACH_MODEL.clone(),
        })
    }
}

// Structures matching the /chat/completions endpoint
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: Message,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Deserialize, Debug)]
struct ApiErrorDetail {
    message: String,
}

pub struct OpenAiClient {
    client: Client,
    settings: CompletionSettings,
}

impl OpenAiClient {
    pub fn new(settings: CompletionSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    async fn send(&self, messages: &[Message], stream: bool) -> CoachResult<reqwest::Response> {
        let url = self.completions_url();
        let request = ChatRequest {
            model: &self.settings.model,
            messages,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(%url, "Failed to reach completion service: {}", e);
                CoachError::Http(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Completion request failed");
            return Err(api_error(status.as_u16(), &body));
        }

        Ok(response)
    }

    /// Non-streamed completion: the whole assistant reply in one response.
    #[instrument(skip(self, messages), fields(model = %self.settings.model, message_count = messages.len()))]
    pub async fn complete(&self, messages: &[Message]) -> CoachResult<String> {
        let response = self.send(messages, false).await?;
        let body = response
            .json::<ChatResponse>()
            .await
            .map_err(|e| CoachError::MalformedResponse(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CoachError::MalformedResponse("response has no choices".to_string()))
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    #[instrument(skip(self, messages), fields(model = %self.settings.model, message_count = messages.len()))]
    async fn stream_completion(&self, messages: &[Message]) -> CoachResult<FragmentStream> {
        debug!("Sending streaming completion request");
        let response = self.send(messages, true).await?;
        Ok(fragment_stream(response.bytes_stream()))
    }
}

fn api_error(status: u16, body: &str) -> CoachError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    CoachError::Api { status, message }
}

/// Drains a fragment stream into the full response text.
pub async fn collect_fragments(mut fragments: FragmentStream) -> CoachResult<String> {
    let mut text = String::new();
    while let Some(fragment) = fragments.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Line buffer for server-sent events split across network chunks.
///
/// Buffers raw bytes so a multi-byte character split between two chunks is
/// decoded whole.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns the events from every newly completed line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            events.extend(parse_line(&String::from_utf8_lossy(&line)));
        }
        events
    }

    /// Parses whatever is left once the byte stream has ended.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&remaining))
            .into_iter()
            .collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    // event:, id:, retry: and ":" comments carry nothing we use
    let data = line.trim().strip_prefix("data:")?.trim();
    match data {
        "" => None,
        "[DONE]" => Some(SseEvent::Done),
        payload => Some(SseEvent::Data(payload.to_string())),
    }
}

fn parse_delta(payload: &str) -> CoachResult<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
        warn!(%payload, "Unparseable stream chunk");
        CoachError::MalformedResponse(e.to_string())
    })?;

    if let Some(err) = chunk.error {
        return Err(CoachError::Stream(err.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

struct FragmentState<E> {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>,
    parser: SseLineBuffer,
    pending: VecDeque<CoachResult<String>>,
    finished: bool,
}

impl<E> FragmentState<E> {
    fn queue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Data(payload) => match parse_delta(&payload) {
                    Ok(Some(text)) => self.pending.push_back(Ok(text)),
                    Ok(None) => {}
                    Err(e) => {
                        self.pending.push_back(Err(e));
                        self.finished = true;
                    }
                },
                SseEvent::Done => self.finished = true,
            }
        }
    }
}

/// Turns a raw SSE byte stream into text fragments.
///
/// Ends at `[DONE]` or when the bytes run out; a read or parse failure is
/// yielded once and ends the stream.
pub fn fragment_stream<S, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = FragmentState {
        bytes: Box::pin(bytes),
        parser: SseLineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.feed(&chunk);
                    state.queue(events);
                }
                Some(Err(e)) => {
                    error!("Error reading completion stream: {}", e);
                    state.finished = true;
                    return Some((Err(CoachError::Stream(e.to_string())), state));
                }
                None => {
                    let events = state.parser.flush();
                    state.queue(events);
                    state.finished = true;
                }
            }
        }
    }))
}
