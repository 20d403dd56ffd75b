//! Vendor specific [`ModelProvider`](crate::provider::ModelProvider) implementations.
//!
//! Each submodule offers a concrete client that speaks a particular vendor's API while
//! conforming to the uniform contract. Every vendor here exposes an OpenAI compatible
//! `/chat/completions` surface, so the shared wire handling lives in [`common`].

use crate::tokenlingo::provider::{ModelProvider, ProviderKind};
use std::sync::Arc;

pub mod common;
pub mod http_pool;

pub mod claude;
pub mod gemini;
pub mod grok;
pub mod openai;

/// Build the crate's HTTP adapter for `kind`.
pub fn client_for(kind: ProviderKind, secret_key: &str, model: &str) -> Arc<dyn ModelProvider> {
    match kind {
        ProviderKind::OpenAI => Arc::new(openai::OpenAIClient::new_with_model_string(secret_key, model)),
        ProviderKind::Anthropic => Arc::new(claude::ClaudeClient::new_with_model_str(secret_key, model)),
        ProviderKind::Gemini => Arc::new(gemini::GeminiClient::new_with_model_str(secret_key, model)),
        ProviderKind::Grok => Arc::new(grok::GrokClient::new_with_model_str(secret_key, model)),
    }
}
