//! Anthropic Claude client built on the OpenAI compatible transport.
//!
//! The wrapper delegates HTTP concerns to [`OpenAIClient`], so swapping a participant from
//! OpenAI to Claude only requires a different provider tag.

use crate::tokenlingo::clients::openai::OpenAIClient;
use crate::tokenlingo::error::ProviderError;
use crate::tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRequest, ProviderResponse};
use async_trait::async_trait;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic Claude models available through the compatibility layer.
pub enum Model {
    /// `claude-sonnet-4-5`
    ClaudeSonnet45,
    /// `claude-haiku-4-5`
    ClaudeHaiku45,
    /// `claude-opus-4-1`
    ClaudeOpus41,
    /// `claude-sonnet-4-0`
    ClaudeSonnet4,
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::ClaudeSonnet45 => "claude-sonnet-4-5".to_string(),
        Model::ClaudeHaiku45 => "claude-haiku-4-5".to_string(),
        Model::ClaudeOpus41 => "claude-opus-4-1".to_string(),
        Model::ClaudeSonnet4 => "claude-sonnet-4-0".to_string(),
    }
}

/// Blended USD per token.
pub fn cost_per_token(model: &str) -> f64 {
    if model.contains("opus") {
        0.000_045
    } else if model.contains("haiku") {
        0.000_003
    } else {
        0.000_009
    }
}

pub struct ClaudeClient {
    delegate_client: OpenAIClient,
}

impl ClaudeClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, ANTHROPIC_BASE_URL)
    }

    /// Point the client at a custom Claude compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        ClaudeClient {
            // we reuse the OpenAIClient for Claude and delegate the calls to it
            delegate_client: OpenAIClient::new_with_base_url(secret_key, model_name, base_url)
                .for_vendor(ProviderKind::Anthropic, cost_per_token(model_name)),
        }
    }
}

#[async_trait]
impl ModelProvider for ClaudeClient {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.delegate_client.send(request).await
    }

    fn model_name(&self) -> &str {
        self.delegate_client.model_name()
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn cost_per_token(&self) -> f64 {
        self.delegate_client.cost_per_token()
    }
}
