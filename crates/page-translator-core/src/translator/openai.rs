use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::prompt;
use super::traits::{
    ChunkCallback, FixHint, PageTranslation, Translator, TranslatorInfo, VerificationReport,
};
use crate::config::{Lang, TranslatorConfig};
use crate::error::{Error, Result};
use crate::source::PageInput;

/// OpenAI-compatible API translator
/// Works with: llama.cpp server, Ollama, DeepSeek, OpenAI, etc.
pub struct OpenAiTranslator {
    client: Client,
    /// Base URL for the API (e.g., "http://localhost:8080/v1")
    pub api_base: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Model identifier
    pub model: String,
    /// Number of attempts per request
    pub retry_count: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Ask for SSE streaming when a chunk callback is supplied
    pub stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    /// Plain string or an array of content parts
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiTranslator {
    /// Create a translator from configuration.
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::TranslationRequest(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            retry_count: config.retry_count.max(1),
            retry_delay_ms: config.retry_delay_ms,
            stream: config.stream,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    /// Make API request with retry logic
    async fn request_with_retry(
        &self,
        request: &ChatRequest,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<String> {
        let url = self.endpoint();
        let mut last_error = None;

        for attempt in 0..self.retry_count {
            debug!(
                "Request attempt {}/{} to {}",
                attempt + 1,
                self.retry_count,
                url
            );

            let mut req = self.client.post(&url).json(request);

            if let Some(ref key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {key}"));
            }

            let is_last = attempt + 1 == self.retry_count;

            match req.send().await {
                Ok(response) if response.status().is_success() => {
                    let body = if request.stream {
                        read_event_stream(response, on_chunk).await
                    } else {
                        read_completion(response).await
                    };
                    match body {
                        Ok(content) => return Ok(content),
                        Err(e) => {
                            warn!("Failed to read response: {}", e);
                            last_error = Some(e);
                        }
                    }
                }
                Ok(response) if response.status().as_u16() == 429 => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());

                    warn!("Rate limited, retry after {:?}s", retry_after);
                    last_error = Some(Error::TranslationRateLimited { retry_after });

                    if !is_last {
                        let wait_time = retry_after.unwrap_or(5) * 1000;
                        tokio::time::sleep(Duration::from_millis(wait_time)).await;
                    }
                    continue;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!("API error: {} - {}", status, body);
                    last_error = Some(Error::TranslationRequest(format!("HTTP {status}: {body}")));
                }
                Err(e) => {
                    warn!("Request failed: {}", e);
                    if e.is_timeout() {
                        last_error = Some(Error::TranslationTimeout);
                    } else {
                        last_error = Some(Error::TranslationRequest(e.to_string()));
                    }
                }
            }

            if !is_last {
                tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
            }
        }

        error!("Request failed after {} attempts", self.retry_count);
        Err(last_error.unwrap_or(Error::TranslationMaxRetriesExceeded))
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    fn info(&self) -> TranslatorInfo {
        TranslatorInfo {
            name: "OpenAI Compatible",
            model: self.model.clone(),
            supports_vision: true,
            supports_streaming: self.stream,
        }
    }

    async fn translate(
        &self,
        input: &PageInput,
        source: &Lang,
        target: &Lang,
        hint: Option<&FixHint>,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<PageTranslation> {
        if let PageInput::Text(text) = input
            && text.trim().is_empty()
        {
            debug!("Page has no text, recording it as blank");
            return Ok(PageTranslation::blank());
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: Value::String(prompt::translation_instructions(source, target, hint)),
                },
                Message {
                    role: "user",
                    content: user_content(input, None),
                },
            ],
            temperature: Some(0.3),
            max_tokens: None,
            stream: self.stream && on_chunk.is_some(),
            response_format: None,
        };

        let raw = self.request_with_retry(&request, on_chunk).await?;
        let translation = prompt::split_translation(&raw);
        if translation.text.is_empty() {
            return Err(Error::TranslationInvalidResponse(
                "Empty translation".to_string(),
            ));
        }
        Ok(translation)
    }

    async fn verify(
        &self,
        translated: &str,
        input: &PageInput,
        source: &Lang,
        target: &Lang,
    ) -> Result<VerificationReport> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: Value::String(prompt::verification_instructions(source, target)),
                },
                Message {
                    role: "user",
                    content: user_content(input, Some(translated)),
                },
            ],
            temperature: Some(0.0),
            max_tokens: None,
            stream: false,
            response_format: Some(json!({ "type": "json_object" })),
        };

        let raw = self.request_with_retry(&request, None).await?;
        prompt::parse_verification(&raw)
    }

    fn is_available(&self) -> bool {
        // Local servers work without an API key
        !self.api_base.trim().is_empty()
    }
}

/// Build the user message: the page itself, then the translation under review.
fn user_content(input: &PageInput, translated: Option<&str>) -> Value {
    let mut parts = vec![match input {
        PageInput::Text(text) => json!({ "type": "text", "text": format!("Source page:\n{text}") }),
        PageInput::Image { bytes, mime } => json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{mime};base64,{}", BASE64.encode(bytes)) },
        }),
    }];
    if let Some(translated) = translated {
        parts.push(json!({ "type": "text", "text": format!("Translation:\n{translated}") }));
    }
    Value::Array(parts)
}

async fn read_completion(response: Response) -> Result<String> {
    let chat_response = response
        .json::<ChatResponse>()
        .await
        .map_err(|e| Error::TranslationInvalidResponse(e.to_string()))?;
    chat_response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::TranslationInvalidResponse("No choices in response".to_string()))
}

/// Accumulate an SSE completion, reporting visible text as it grows.
async fn read_event_stream(response: Response, on_chunk: Option<&ChunkCallback>) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut content = String::new();
    let mut reported = 0;

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                Error::TranslationTimeout
            } else {
                Error::TranslationRequest(e.to_string())
            }
        })?;

        for data in decoder.push(&chunk) {
            if data == "[DONE]" {
                break 'outer;
            }
            match serde_json::from_str::<StreamChunk>(&data) {
                Ok(parsed) => {
                    for choice in parsed.choices {
                        if let Some(delta) = choice.delta.content {
                            content.push_str(&delta);
                        }
                    }
                }
                Err(e) => debug!("Skipping unparseable stream event: {}", e),
            }
        }

        if let Some(callback) = on_chunk {
            let visible = prompt::visible_prefix(&content);
            if visible.len() > reported {
                reported = visible.len();
                callback(visible);
            }
        }
    }

    Ok(content)
}

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
