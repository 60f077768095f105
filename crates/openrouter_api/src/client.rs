use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};

use crate::config::OpenRouterConfig;
use crate::error::{parse_error_message, OpenRouterError};
use crate::events::ChatStreamEvent;
use crate::headers::build_headers;
use crate::payload::ChatCompletionRequest;
use crate::retry::{is_retryable_http_error, retry_delay_ms, MAX_RETRIES};
use crate::sse::SseStreamParser;
use crate::url::normalize_chat_completions_url;

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct OpenRouterClient {
    http: Client,
    config: OpenRouterConfig,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub events: Vec<ChatStreamEvent>,
    pub finish_reason: Option<String>,
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> Result<Self, OpenRouterError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(OpenRouterError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OpenRouterConfig {
        &self.config
    }

    pub fn normalized_endpoint(&self) -> String {
        normalize_chat_completions_url(&self.config.base_url)
    }

    pub fn build_headers(&self) -> Result<HeaderMap, OpenRouterError> {
        let headers = build_headers(&self.config)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| OpenRouterError::InvalidHeader(format!("invalid key: {key}")))?,
                HeaderValue::from_str(&value)
                    .map_err(|_| OpenRouterError::InvalidHeader(format!("invalid value for {key}")))?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, OpenRouterError> {
        validate_request_payload_shape(request)?;

        let headers = self.build_headers()?;
        let payload = self.request_with_transport_defaults(request);
        Ok(self
            .http
            .post(self.normalized_endpoint())
            .headers(headers)
            .json(&payload))
    }

    fn request_with_transport_defaults(
        &self,
        request: &ChatCompletionRequest,
    ) -> ChatCompletionRequest {
        let mut payload = request.clone();
        payload.stream = true;
        if payload.temperature.is_none() {
            payload.temperature = self.config.default_temperature;
        }
        if payload.tools.is_empty() {
            payload.tool_choice = None;
        } else if payload.tool_choice.is_none() {
            payload.tool_choice = Some("auto".to_owned());
        }
        payload
    }

    pub async fn send_with_retry(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, OpenRouterError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if is_cancelled(cancellation) {
                return Err(OpenRouterError::Cancelled);
            }

            let response = self.build_request(request)?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(OpenRouterError::from);

            match response {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < MAX_RETRIES && is_retryable_http_error(status.as_u16(), &body) {
                        tracing::warn!(
                            attempt,
                            status = status.as_u16(),
                            error = %message,
                            "retrying chat completion request"
                        );
                        await_or_cancel(tokio::time::sleep(retry_delay_ms(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(OpenRouterError::Status(status, message));
                }
                Err(error) => {
                    let message = error.to_string();
                    last_error = Some(message.clone());
                    if attempt < MAX_RETRIES {
                        tracing::warn!(attempt, error = %message, "retrying chat completion request");
                        await_or_cancel(tokio::time::sleep(retry_delay_ms(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(OpenRouterError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(OpenRouterError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Streams one completion, handing each normalized event to `on_event` as
    /// it is parsed. Returns the finish reason when the stream reported one.
    pub async fn stream_with_handler<F>(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
        on_event: F,
    ) -> Result<Option<String>, OpenRouterError>
    where
        F: FnMut(ChatStreamEvent),
    {
        self.stream_with_buffer_limit(request, None, cancellation, on_event)
            .await
    }

    /// Like [`Self::stream_with_handler`], with a per-request SSE buffer limit
    /// that overrides the configured one.
    pub async fn stream_with_buffer_limit<F>(
        &self,
        request: &ChatCompletionRequest,
        max_buffer_size: Option<usize>,
        cancellation: Option<&CancellationSignal>,
        mut on_event: F,
    ) -> Result<Option<String>, OpenRouterError>
    where
        F: FnMut(ChatStreamEvent),
    {
        let response = self.send_with_retry(request, cancellation).await?;
        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::with_max_buffer_size(
            max_buffer_size.or(self.config.max_buffer_size),
        );
        let mut finish_reason = None;

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(OpenRouterError::Cancelled);
            }
            let chunk = chunk.map_err(OpenRouterError::from)?;
            for event in parser.feed(&chunk)? {
                process_stream_event(event, &mut finish_reason, &mut on_event)?;
            }
        }

        if is_cancelled(cancellation) {
            return Err(OpenRouterError::Cancelled);
        }

        Ok(finish_reason)
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<StreamResult, OpenRouterError> {
        let mut events = Vec::new();
        let finish_reason = self
            .stream_with_handler(request, cancellation, |event| {
                events.push(event);
            })
            .await?;

        Ok(StreamResult {
            events,
            finish_reason,
        })
    }
}

fn validate_request_payload_shape(request: &ChatCompletionRequest) -> Result<(), OpenRouterError> {
    if request.model.trim().is_empty() {
        return Err(OpenRouterError::InvalidRequestPayload(
            "'model' must not be empty".to_string(),
        ));
    }
    if request.messages.is_empty() {
        return Err(OpenRouterError::InvalidRequestPayload(
            "'messages' must contain at least one message".to_string(),
        ));
    }
    if let Some(position) = request
        .messages
        .iter()
        .position(|message| message.get("role").and_then(|role| role.as_str()).is_none())
    {
        return Err(OpenRouterError::InvalidRequestPayload(format!(
            "message {position} is missing a string 'role'"
        )));
    }
    Ok(())
}

fn process_stream_event<F>(
    event: ChatStreamEvent,
    finish_reason: &mut Option<String>,
    on_event: &mut F,
) -> Result<(), OpenRouterError>
where
    F: FnMut(ChatStreamEvent),
{
    if let ChatStreamEvent::Error { code, message } = &event {
        return Err(OpenRouterError::StreamFailed {
            code: code.clone(),
            message: message
                .clone()
                .or_else(|| code.clone())
                .unwrap_or_else(|| "unknown stream error".to_owned()),
        });
    }

    if let ChatStreamEvent::Finished { reason } = &event {
        if reason.is_some() {
            finish_reason.clone_from(reason);
        }
    }

    on_event(event);
    Ok(())
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, OpenRouterError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(OpenRouterError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(OpenRouterError::Cancelled);
            }
            return Ok(output);
        }
    }
}
