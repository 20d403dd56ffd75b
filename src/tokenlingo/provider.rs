//! Provider capability interface and the registry the orchestrator resolves adapters from.
//!
//! A [`ModelProvider`] is a thin wrapper around one vendor's inference API. It does not keep
//! track of the conversation; the [`SessionOrchestrator`](crate::orchestrator::SessionOrchestrator)
//! owns the transcript and hands each call the trailing window it should see.
//!
//! Adapters are chosen per participant at session start by [`ProviderKind`]. The registry is
//! injected into the orchestrator explicitly; there is no process-wide provider table.
//!
//! ```rust
//! use std::sync::Arc;
//! use tokenlingo::clients::openai::OpenAIClient;
//! use tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRegistry};
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(ProviderKind::OpenAI, |model: &str| {
//!     Arc::new(OpenAIClient::new_with_model_string("sk-test-key", model)) as Arc<dyn ModelProvider>
//! });
//! assert!(registry.is_available(ProviderKind::OpenAI));
//! assert!(!registry.is_available(ProviderKind::Gemini));
//! ```

use crate::tokenlingo::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Represents the possible roles for a context message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Steers the model (pattern notes, coaching).
    System,
    /// Utterances from the other participants.
    User,
    /// The speaker's own earlier utterances.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single context message sent alongside the prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
        }
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Why the model stopped generating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map a vendor finish reason string (`"stop"`, `"length"`, `"end_turn"`, ...).
    pub fn from_vendor(raw: Option<&str>) -> Self {
        match raw {
            None | Some("stop") | Some("end_turn") | Some("STOP") => FinishReason::Stop,
            Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => FinishReason::Length,
            Some("content_filter") | Some("SAFETY") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }
}

/// Everything an adapter needs for one turn.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    /// Instruction text for this turn, sent last.
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    /// System note plus the trailing transcript window, oldest first.
    pub context: Vec<Message>,
}

/// Normalized successful response.
#[derive(Clone, Debug)]
pub struct ProviderResponse {
    pub text: String,
    pub token_usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Uniform contract every vendor adapter implements.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one inference call. Vendor faults must be mapped into [`ProviderError`].
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Model identifier this adapter was built for.
    fn model_name(&self) -> &str;

    fn provider_kind(&self) -> ProviderKind;

    /// Fallback token estimate when usage metadata is unavailable.
    /// Uses an approximate formula: one token per 4 characters.
    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_token_count(text)
    }

    /// Blended USD cost per token, used for analytics and start-time cost estimates.
    fn cost_per_token(&self) -> f64;
}

/// Approximate token count: one token per 4 characters, never zero for non-empty text.
pub fn estimate_token_count(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / 4).max(1)
}

/// The vendors the crate ships adapters for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Gemini,
    #[serde(rename = "xai")]
    Grok,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAI,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::Grok,
    ];

    /// Canonical tag used in participant records.
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "google",
            ProviderKind::Grok => "xai",
        }
    }

    /// Environment variable holding the credential.
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Grok => "XAI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Gemini),
            "xai" | "grok" => Ok(ProviderKind::Grok),
            other => Err(other.to_string()),
        }
    }
}

/// Builds an adapter for a given model identifier.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Arc<dyn ModelProvider> + Send + Sync>;

/// Adapter factories keyed by provider, plus the raw credentials used to build them.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, ProviderFactory>,
    credentials: HashMap<ProviderKind, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: ProviderKind, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Arc<dyn ModelProvider> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    /// Register one adapter instance that serves every model of `kind`.
    pub fn register_instance(&mut self, kind: ProviderKind, provider: Arc<dyn ModelProvider>) -> &mut Self {
        self.register(kind, move |_model: &str| provider.clone())
    }

    /// Remember the credential for `kind` so [`ProviderRegistry::check_credential`] can inspect it.
    pub fn with_credential(mut self, kind: ProviderKind, key: impl Into<String>) -> Self {
        self.credentials.insert(kind, key.into());
        self
    }

    /// Build a registry from the `*_API_KEY` environment variables. Every provider with a
    /// non-empty key gets the crate's HTTP adapter.
    pub fn from_env() -> Self {
        use crate::tokenlingo::clients;

        let mut registry = ProviderRegistry::new();
        for kind in ProviderKind::ALL {
            let key = match std::env::var(kind.env_var()) {
                Ok(key) if !key.trim().is_empty() => key,
                _ => continue,
            };
            log::debug!("tokenlingo::provider: registering {} from environment", kind);
            registry.credentials.insert(kind, key.clone());
            registry.register(kind, move |model: &str| clients::client_for(kind, &key, model));
        }
        registry
    }

    pub fn is_available(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the adapter for `kind`/`model`, or `None` when no factory is configured.
    pub fn resolve(&self, kind: ProviderKind, model: &str) -> Option<Arc<dyn ModelProvider>> {
        self.factories.get(&kind).map(|factory| factory(model))
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Superficial credential check backing the provider-test endpoint.
    pub fn check_credential(&self, kind: ProviderKind) -> CredentialCheck {
        validate_credential(kind, self.credentials.get(&kind).map(String::as_str))
    }
}

/// Verdict of [`validate_credential`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum CredentialCheck {
    Valid,
    Missing,
    Malformed(String),
}

impl CredentialCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, CredentialCheck::Valid)
    }
}

/// Prefix and length heuristics per vendor. Does not contact the vendor.
///
/// ```
/// use tokenlingo::provider::{validate_credential, CredentialCheck, ProviderKind};
///
/// assert_eq!(validate_credential(ProviderKind::OpenAI, None), CredentialCheck::Missing);
/// assert!(validate_credential(ProviderKind::Grok, Some("xai-0123456789abcdefghij")).is_valid());
/// assert!(!validate_credential(ProviderKind::Anthropic, Some("sk-short")).is_valid());
/// ```
pub fn validate_credential(kind: ProviderKind, key: Option<&str>) -> CredentialCheck {
    let key = match key.map(str::trim) {
        Some(k) if !k.is_empty() => k,
        _ => return CredentialCheck::Missing,
    };

    let (prefix, length_ok, length_rule) = match kind {
        ProviderKind::OpenAI => ("sk-", key.len() >= 20, "at least 20 characters"),
        ProviderKind::Anthropic => ("sk-ant-", key.len() >= 30, "at least 30 characters"),
        ProviderKind::Gemini => ("AIza", key.len() == 39, "exactly 39 characters"),
        ProviderKind::Grok => ("xai-", key.len() >= 20, "at least 20 characters"),
    };

    if !key.starts_with(prefix) {
        return CredentialCheck::Malformed(format!("{} keys start with '{}'", kind, prefix));
    }
    if !length_ok {
        return CredentialCheck::Malformed(format!("{} keys are {}", kind, length_rule));
    }
    CredentialCheck::Valid
}
