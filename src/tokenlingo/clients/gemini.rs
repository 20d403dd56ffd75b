//! Google Gemini client using Google's OpenAI compatible endpoint.

use crate::tokenlingo::clients::openai::OpenAIClient;
use crate::tokenlingo::error::ProviderError;
use crate::tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRequest, ProviderResponse};
use async_trait::async_trait;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub enum Model {
    Gemini25Pro,
    Gemini25Flash,
    Gemini25FlashLite,
    Gemini20Flash,
}

pub fn model_to_string(model: Model) -> String {
    match model {
        Model::Gemini25Pro => "gemini-2.5-pro".to_string(),
        Model::Gemini25Flash => "gemini-2.5-flash".to_string(),
        Model::Gemini25FlashLite => "gemini-2.5-flash-lite".to_string(),
        Model::Gemini20Flash => "gemini-2.0-flash".to_string(),
    }
}

/// Blended USD per token.
pub fn cost_per_token(model: &str) -> f64 {
    if model.contains("pro") {
        0.000_005_6
    } else if model.contains("lite") {
        0.000_000_25
    } else {
        0.000_001_4
    }
}

pub struct GeminiClient {
    delegate_client: OpenAIClient,
}

impl GeminiClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        GeminiClient {
            delegate_client: OpenAIClient::new_with_base_url(secret_key, model_name, GEMINI_BASE_URL)
                .for_vendor(ProviderKind::Gemini, cost_per_token(model_name)),
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiClient {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.delegate_client.send(request).await
    }

    fn model_name(&self) -> &str {
        self.delegate_client.model_name()
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn cost_per_token(&self) -> f64 {
        self.delegate_client.cost_per_token()
    }
}
