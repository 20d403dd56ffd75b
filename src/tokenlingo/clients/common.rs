//! Wire handling shared by every OpenAI compatible adapter.
//!
//! [`send_chat`] posts a `/chat/completions` request, maps HTTP and transport faults into the
//! [`ProviderError`] taxonomy, and falls back to estimated token counts when the vendor omits
//! `usage` from the response.

use crate::tokenlingo::error::ProviderError;
use crate::tokenlingo::provider::{
    estimate_token_count, FinishReason, ProviderRequest, ProviderResponse, Role, TokenUsage,
};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Send one chat completion request and normalize the outcome.
pub async fn send_chat(
    http: &reqwest::Client,
    base_url: &str,
    secret_key: &str,
    request: &ProviderRequest,
) -> Result<ProviderResponse, ProviderError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let mut messages: Vec<ChatMessage<'_>> = request
        .context
        .iter()
        .map(|m| ChatMessage {
            role: m.role.as_str(),
            content: m.content.as_str(),
        })
        .collect();
    messages.push(ChatMessage {
        role: Role::User.as_str(),
        content: request.prompt.as_str(),
    });

    let body = ChatRequest {
        model: &request.model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };

    let response = http
        .post(&url)
        .bearer_auth(secret_key)
        .json(&body)
        .send()
        .await
        .map_err(|err| {
            log::error!(
                "tokenlingo::clients::common::send_chat(...): request to {} failed: {}",
                url,
                err
            );
            ProviderError::network(format!("request to {} failed: {}", url, err))
        })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let raw = response.text().await.unwrap_or_default();
        let message = extract_error_message(&raw);
        log::error!(
            "tokenlingo::clients::common::send_chat(...): {} answered HTTP {}: {}",
            url,
            status.as_u16(),
            message
        );
        let err = ProviderError::from_status(status.as_u16(), &message, retry_after);
        return Err(fill_token_limit(err, request));
    }

    let parsed: ChatResponse = response.json().await.map_err(|err| {
        log::error!(
            "tokenlingo::clients::common::send_chat(...): unreadable response from {}: {}",
            url,
            err
        );
        ProviderError::malformed(format!("unreadable response body: {}", err))
    })?;

    into_provider_response(parsed, request)
}

/// Normalize a parsed response, estimating usage when the vendor did not report it.
pub(crate) fn into_provider_response(
    parsed: ChatResponse,
    request: &ProviderRequest,
) -> Result<ProviderResponse, ProviderError> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::malformed("response contained no choices"))?;

    let text = choice.message.content.unwrap_or_default();
    let finish_reason = FinishReason::from_vendor(choice.finish_reason.as_deref());

    let token_usage = match parsed.usage {
        Some(usage) => TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or(usage.prompt_tokens + usage.completion_tokens),
        },
        None => TokenUsage::new(estimate_request_tokens(request) as u64, estimate_token_count(&text) as u64),
    };

    Ok(ProviderResponse {
        text,
        token_usage,
        finish_reason,
    })
}

fn estimate_request_tokens(request: &ProviderRequest) -> usize {
    request
        .context
        .iter()
        .map(|m| estimate_token_count(&m.content) + 1)
        .sum::<usize>()
        + estimate_token_count(&request.prompt)
}

/// Vendors do not always repeat the requested size in the error body.
fn fill_token_limit(err: ProviderError, request: &ProviderRequest) -> ProviderError {
    match err {
        ProviderError::TokenLimit { requested: 0, max } => ProviderError::TokenLimit {
            requested: estimate_request_tokens(request) + request.max_tokens,
            max,
        },
        other => other,
    }
}

fn extract_error_message(raw: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(raw)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| raw.to_string())
}

/// Only the delta-seconds form of `Retry-After` is honoured.
fn parse_retry_after(header: Option<&HeaderValue>) -> Option<u64> {
    header?.to_str().ok()?.trim().parse::<u64>().ok()
}
