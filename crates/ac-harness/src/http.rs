//! Adapter for any endpoint speaking the `/v1/chat/completions` protocol.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::provider::{ProviderAdapter, ProviderErrorKind, ProviderResponse, Usage};

pub struct OpenAiCompatibleAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        // Builder only fails on TLS backend init; fall back to the default client.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            default_model: default_model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Map an HTTP status to a failure kind.
fn classify_status(status: u16) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::Auth,
        408 | 504 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        _ => ProviderErrorKind::Other,
    }
}

fn classify_transport(err: &reqwest::Error) -> ProviderErrorKind {
    if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_decode() {
        ProviderErrorKind::InvalidResponse
    } else {
        ProviderErrorKind::Network
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn call(&self, prompt: &str, model: &str) -> ProviderResponse {
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return ProviderResponse::failure(classify_transport(&e), e.to_string()),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return ProviderResponse::failure(
                classify_status(status.as_u16()),
                format!("status {}: {}", status.as_u16(), text),
            );
        }

        let parsed: CompletionBody = match resp.json().await {
            Ok(body) => body,
            Err(e) => return ProviderResponse::failure(classify_transport(&e), e.to_string()),
        };

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        match content {
            Some(content) => ProviderResponse::Success {
                content,
                usage: parsed.usage.map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    cost_estimate: None,
                }),
            },
            None => ProviderResponse::failure(
                ProviderErrorKind::InvalidResponse,
                "no choices in response",
            ),
        }
    }
}
