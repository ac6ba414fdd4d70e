//! Text generation with ordered provider failover
//!
//! Providers are tried in order (remote primary, then local fallback); each
//! attempt catches connectivity, rate-limit, and generic failures and falls
//! through to the next. When a sink is supplied, the reachable provider
//! streams incremental text deltas into it as they arrive. If every provider
//! fails, the caller gets a fixed apology string with provider name "None" -
//! never an error.

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::{LlmConfig, ProviderConfig};
use crate::{Error, Result};

/// Terminal failure response when every provider is exhausted
pub const APOLOGY: &str = "Oops! My thinking cap is offline right now.";

/// Provider name reported with [`APOLOGY`]
pub const NO_PROVIDER: &str = "None";

/// One text-generation backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Diagnostic name reported alongside responses
    fn name(&self) -> &str;

    /// Run one chat completion, streaming text deltas into `on_delta` and
    /// returning the accumulated full text
    ///
    /// # Errors
    ///
    /// Returns error on connectivity, rate-limit, or API failures
    async fn stream_chat(
        &self,
        system: &str,
        prompt: &str,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String>;
}

/// Receives streamed text across provider attempts.
///
/// [`attempt_started`] fires before each provider is tried, so a sink that
/// accumulates text can discard whatever a failed attempt left behind instead
/// of merging it into the next provider's output.
///
/// [`attempt_started`]: ChunkSink::attempt_started
pub trait ChunkSink: Send {
    /// A new provider attempt is starting; drop partial text from the
    /// previous one
    fn attempt_started(&mut self) {}

    /// Incremental text from the current attempt
    fn delta(&mut self, chunk: &str);
}

impl<F> ChunkSink for F
where
    F: FnMut(&str) + Send,
{
    fn delta(&mut self, chunk: &str) {
        self(chunk);
    }
}

/// OpenAI-compatible `chat/completions` client with SSE streaming
pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiCompatProvider {
    /// Create a provider from config
    #[must_use]
    pub fn new(config: &ProviderConfig, temperature: f32) -> Self {
        Self {
            name: config.name.clone(),
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_chat(
        &self,
        system: &str,
        prompt: &str,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "temperature": self.temperature,
            "stream": true,
        });

        tracing::debug!(provider = %self.name, model = %self.model, "sending chat completion request");

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    Error::Llm(format!("could not connect to {}: {e}", self.base_url))
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(Error::Llm(format!("rate limited: {body}")));
            }
            return Err(Error::Llm(format!("HTTP {status}: {body}")));
        }

        // Read the SSE stream line by line; a data: line may be split
        // across byte chunks, so carry the partial tail
        let mut byte_stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut full = String::new();

        'stream: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| Error::Llm(format!("stream error: {e}")))?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                match parse_sse_line(line.trim_end())? {
                    Some(SseEvent::Delta(text)) => {
                        full.push_str(&text);
                        on_delta(&text);
                    }
                    Some(SseEvent::Done) => break 'stream,
                    None => {}
                }
            }
        }

        Ok(full)
    }
}

/// One parsed SSE event from the completion stream
enum SseEvent {
    /// Incremental text content
    Delta(String),
    /// The `[DONE]` end-of-stream sentinel
    Done,
}

/// Parse a single SSE line. Non-`data:` lines and empty payloads yield `None`.
fn parse_sse_line(line: &str) -> Result<Option<SseEvent>> {
    #[derive(serde::Deserialize)]
    struct StreamDelta {
        choices: Vec<StreamChoice>,
    }
    #[derive(serde::Deserialize)]
    struct StreamChoice {
        delta: DeltaContent,
    }
    #[derive(serde::Deserialize, Default)]
    struct DeltaContent {
        #[serde(default)]
        content: Option<String>,
    }

    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim_start();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    let delta: StreamDelta = serde_json::from_str(payload)
        .map_err(|e| Error::Llm(format!("malformed SSE delta: {e}")))?;

    Ok(delta
        .choices
        .first()
        .and_then(|c| c.delta.content.as_ref())
        .filter(|text| !text.is_empty())
        .map(|text| SseEvent::Delta(text.clone())))
}

/// Ordered provider attempts with a fixed terminal apology
pub struct ResponseStreamer {
    providers: Vec<Box<dyn ChatProvider>>,
    system_prompt: String,
}

impl ResponseStreamer {
    /// Build the primary + fallback chain from config
    #[must_use]
    pub fn new(config: &LlmConfig, persona: &str) -> Self {
        Self {
            providers: vec![
                Box::new(OpenAiCompatProvider::new(&config.primary, config.temperature)),
                Box::new(OpenAiCompatProvider::new(&config.fallback, config.temperature)),
            ],
            system_prompt: persona.to_string(),
        }
    }

    /// Build over explicit providers (tests, custom chains)
    #[must_use]
    pub fn with_providers(providers: Vec<Box<dyn ChatProvider>>, persona: &str) -> Self {
        Self {
            providers,
            system_prompt: persona.to_string(),
        }
    }

    /// Generate a reply, optionally streaming chunks into `on_chunk`.
    ///
    /// The sink is told via [`ChunkSink::attempt_started`] every time a new
    /// provider is tried, so deltas from an attempt that later failed are
    /// never merged with the next attempt's output.
    ///
    /// Returns `(text, provider_name)`. Never fails: exhausting every
    /// provider yields `(`[`APOLOGY`]`, `[`NO_PROVIDER`]`)`.
    pub async fn generate(
        &self,
        prompt: &str,
        mut on_chunk: Option<&mut dyn ChunkSink>,
    ) -> (String, String) {
        for provider in &self.providers {
            tracing::debug!(provider = %provider.name(), "trying provider");

            let result = match on_chunk.as_mut() {
                Some(sink) => {
                    sink.attempt_started();
                    provider
                        .stream_chat(&self.system_prompt, prompt, &mut |chunk: &str| {
                            sink.delta(chunk);
                        })
                        .await
                }
                None => {
                    provider
                        .stream_chat(&self.system_prompt, prompt, &mut |_: &str| {})
                        .await
                }
            };

            match result {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::info!(provider = %provider.name(), "generation successful");
                    return (text.trim().to_string(), provider.name().to_string());
                }
                Ok(_) => {
                    tracing::warn!(provider = %provider.name(), "provider returned empty output");
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.name(),
                        error = %e,
                        "provider failed, trying next"
                    );
                }
            }
        }

        tracing::error!("all text-generation providers failed");
        (APOLOGY.to_string(), NO_PROVIDER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider {
        name: &'static str,
    }

    #[async_trait]
    impl ChatProvider for FailingProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn stream_chat(
            &self,
            _system: &str,
            _prompt: &str,
            _on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String> {
            Err(Error::Llm("could not connect".to_string()))
        }
    }

    struct ScriptedProvider {
        name: &'static str,
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn stream_chat(
            &self,
            _system: &str,
            _prompt: &str,
            on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String> {
            let mut full = String::new();
            for chunk in &self.chunks {
                full.push_str(chunk);
                on_delta(chunk);
            }
            Ok(full)
        }
    }

    /// Streams a partial reply, then fails
    struct PartialThenFailingProvider {
        name: &'static str,
        partial: &'static str,
    }

    #[async_trait]
    impl ChatProvider for PartialThenFailingProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn stream_chat(
            &self,
            _system: &str,
            _prompt: &str,
            on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String> {
            on_delta(self.partial);
            Err(Error::Llm("connection reset mid-stream".to_string()))
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum SinkEvent {
        AttemptStarted,
        Delta(String),
    }

    struct EventSink(Vec<SinkEvent>);

    impl ChunkSink for EventSink {
        fn attempt_started(&mut self) {
            self.0.push(SinkEvent::AttemptStarted);
        }

        fn delta(&mut self, chunk: &str) {
            self.0.push(SinkEvent::Delta(chunk.to_string()));
        }
    }

    #[tokio::test]
    async fn primary_failure_falls_through_to_fallback() {
        let streamer = ResponseStreamer::with_providers(
            vec![
                Box::new(FailingProvider { name: "Primary" }),
                Box::new(ScriptedProvider {
                    name: "Fallback",
                    chunks: vec!["hello"],
                }),
            ],
            "persona",
        );

        let (text, provider) = streamer.generate("hi", None).await;
        assert_eq!(text, "hello");
        assert_eq!(provider, "Fallback");
    }

    #[tokio::test]
    async fn all_providers_exhausted_yields_apology() {
        let streamer = ResponseStreamer::with_providers(
            vec![
                Box::new(FailingProvider { name: "Primary" }),
                Box::new(FailingProvider { name: "Fallback" }),
            ],
            "persona",
        );

        let (text, provider) = streamer.generate("hi", None).await;
        assert_eq!(text, APOLOGY);
        assert_eq!(provider, NO_PROVIDER);
    }

    #[tokio::test]
    async fn chunks_stream_to_the_sink_in_order() {
        let streamer = ResponseStreamer::with_providers(
            vec![Box::new(ScriptedProvider {
                name: "Primary",
                chunks: vec!["One. ", "Two. ", "Three."],
            })],
            "persona",
        );

        let mut seen = Vec::new();
        let mut sink = |chunk: &str| seen.push(chunk.to_string());
        let (text, provider) = streamer.generate("hi", Some(&mut sink)).await;

        assert_eq!(seen, vec!["One. ", "Two. ", "Three."]);
        assert_eq!(text, "One. Two. Three.");
        assert_eq!(provider, "Primary");
    }

    #[tokio::test]
    async fn mid_stream_failure_is_bracketed_by_attempt_boundaries() {
        let streamer = ResponseStreamer::with_providers(
            vec![
                Box::new(PartialThenFailingProvider {
                    name: "Primary",
                    partial: "The answer is fo",
                }),
                Box::new(ScriptedProvider {
                    name: "Fallback",
                    chunks: vec!["The answer is four."],
                }),
            ],
            "persona",
        );

        let mut sink = EventSink(Vec::new());
        let (text, provider) = streamer.generate("hi", Some(&mut sink)).await;

        assert_eq!(text, "The answer is four.");
        assert_eq!(provider, "Fallback");
        // the dead attempt's delta is fenced off from the fallback's
        assert_eq!(
            sink.0,
            vec![
                SinkEvent::AttemptStarted,
                SinkEvent::Delta("The answer is fo".to_string()),
                SinkEvent::AttemptStarted,
                SinkEvent::Delta("The answer is four.".to_string()),
            ]
        );
    }

    #[test]
    fn sse_line_parsing() {
        assert!(parse_sse_line("").unwrap().is_none());
        assert!(parse_sse_line(": keep-alive").unwrap().is_none());
        assert!(parse_sse_line("event: message").unwrap().is_none());
        assert!(matches!(
            parse_sse_line("data: [DONE]").unwrap(),
            Some(SseEvent::Done)
        ));

        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        match parse_sse_line(line).unwrap() {
            Some(SseEvent::Delta(text)) => assert_eq!(text, "Hi"),
            _ => panic!("expected delta"),
        }

        // role-only delta carries no content
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_sse_line(line).unwrap().is_none());

        assert!(parse_sse_line("data: {broken").is_err());
    }
}
