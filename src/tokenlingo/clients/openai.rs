//! The `OpenAIClient` struct implements [`ModelProvider`] for OpenAI's Chat Completions API.
//!
//! It is also the transport the other vendor adapters delegate to, since Anthropic, Google
//! and xAI all expose an OpenAI compatible surface.
//!
//! # Example
//!
//! ```rust,no_run
//! use tokenlingo::clients::openai::{Model, OpenAIClient};
//! use tokenlingo::provider::{ModelProvider, ProviderRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAIClient::new_with_model_enum(&key, Model::GPT41Mini);
//!     let reply = client
//!         .send(&ProviderRequest {
//!             prompt: "Say hi in two tokens.".into(),
//!             model: client.model_name().to_string(),
//!             temperature: 0.7,
//!             max_tokens: 16,
//!             context: vec![],
//!         })
//!         .await?;
//!     println!("{} ({} tokens)", reply.text, reply.token_usage.total_tokens);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use crate::tokenlingo::clients::common::send_chat;
use crate::tokenlingo::clients::http_pool::get_http_client;
use crate::tokenlingo::error::ProviderError;
use crate::tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRequest, ProviderResponse};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Model identifiers commonly used for conversation participants.
pub enum Model {
    /// `gpt-5`
    GPT5,
    /// `gpt-5-mini`
    GPT5Mini,
    /// `gpt-4o`
    GPT4o,
    /// `gpt-4o-mini`
    GPT4oMini,
    /// `gpt-4.1`
    GPT41,
    /// `gpt-4.1-mini`
    GPT41Mini,
    /// `gpt-4.1-nano`
    GPT41Nano,
}

/// Convert a [`Model`] variant into the string identifier expected by the REST API.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT5 => "gpt-5".to_string(),
        Model::GPT5Mini => "gpt-5-mini".to_string(),
        Model::GPT4o => "gpt-4o".to_string(),
        Model::GPT4oMini => "gpt-4o-mini".to_string(),
        Model::GPT41 => "gpt-4.1".to_string(),
        Model::GPT41Mini => "gpt-4.1-mini".to_string(),
        Model::GPT41Nano => "gpt-4.1-nano".to_string(),
    }
}

/// Blended USD per token (input and output averaged).
pub fn cost_per_token(model: &str) -> f64 {
    match model {
        "gpt-5" | "gpt-4.1" => 0.000_005,
        "gpt-4o" => 0.000_006_25,
        "gpt-5-mini" | "gpt-4.1-mini" => 0.000_001,
        "gpt-4o-mini" => 0.000_000_375,
        "gpt-4.1-nano" => 0.000_000_25,
        _ => 0.000_002,
    }
}

/// Client for OpenAI compatible `/chat/completions` endpoints.
pub struct OpenAIClient {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
    model: String,
    kind: ProviderKind,
    cost_per_token: f64,
}

impl OpenAIClient {
    /// Construct a new client using the provided API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// Construct a new client using the provided API key and explicit model name.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, OPENAI_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        OpenAIClient {
            http: get_http_client(base_url),
            secret_key: secret_key.to_string(),
            base_url: base_url.to_string(),
            model: model_name.to_string(),
            kind: ProviderKind::OpenAI,
            cost_per_token: cost_per_token(model_name),
        }
    }

    /// Re-label the client for a vendor that reuses this transport.
    pub(crate) fn for_vendor(mut self, kind: ProviderKind, cost_per_token: f64) -> Self {
        self.kind = kind;
        self.cost_per_token = cost_per_token;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ModelProvider for OpenAIClient {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        send_chat(&self.http, &self.base_url, &self.secret_key, request).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_kind(&self) -> ProviderKind {
        self.kind
    }

    fn cost_per_token(&self) -> f64 {
        self.cost_per_token
    }
}
