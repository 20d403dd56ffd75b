use crate::tokenlingo::clients::openai::OpenAIClient;
use crate::tokenlingo::error::ProviderError;
use crate::tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRequest, ProviderResponse};
use async_trait::async_trait;

pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

pub struct GrokClient {
    client: OpenAIClient,
}

// Models returned by the xAI API
pub enum Model {
    Grok4,       // $3/MMT input $15/MMT output
    Grok3,       // $3/MMT input $15/MMT output
    Grok3Mini,   // $0.30/MMT input $0.50/MMT output
    Grok4FastNonReasoning, // $0.20/MMT input $0.50/MMT output
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::Grok4 => "grok-4".to_string(),
        Model::Grok3 => "grok-3".to_string(),
        Model::Grok3Mini => "grok-3-mini".to_string(),
        Model::Grok4FastNonReasoning => "grok-4-fast-non-reasoning".to_string(),
    }
}

pub fn cost_per_token(model: &str) -> f64 {
    if model.contains("mini") {
        0.000_000_4
    } else if model.contains("fast") {
        0.000_000_35
    } else {
        0.000_009
    }
}

impl GrokClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        GrokClient {
            client: OpenAIClient::new_with_base_url(secret_key, model_name, XAI_BASE_URL)
                .for_vendor(ProviderKind::Grok, cost_per_token(model_name)),
        }
    }
}

#[async_trait]
impl ModelProvider for GrokClient {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.client.send(request).await
    }

    fn model_name(&self) -> &str {
        self.client.model_name()
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Grok
    }

    fn cost_per_token(&self) -> f64 {
        self.client.cost_per_token()
    }
}
