//! Outbound clients: the hosted completion model and the WhatsApp
//! gateway. Both get one `reqwest::Client` with an explicit timeout and
//! make exactly one attempt per call; retrying is the caller's problem
//! and the caller chooses not to.

use std::time::Duration;

use async_trait::async_trait;
use forno_config::Config;
use forno_contracts::{SendTextRequest, SendTextResponse};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error: {0}")]
    Api(String),
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_message: &str)
        -> Result<String, ClientError>;
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_text(&self, request: &SendTextRequest) -> Result<SendTextResponse, ClientError>;
}

/// OpenAI-style chat-completions client.
pub struct OpenAiCompletion {
    client: Client,
    base_url: String,
    model: String,
    temperature: f64,
    api_key: Option<String>,
}

impl OpenAiCompletion {
    pub fn from_config(cfg: &Config) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.agent.timeout_ms))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.agent.base_url.trim_end_matches('/').to_string(),
            model: cfg.agent.model.clone(),
            temperature: cfg.agent.temperature,
            api_key: std::env::var(&cfg.agent.api_key_env).ok(),
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, ClientError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ClientError::MissingCredential("completion api key".to_string()))?;

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!(
                "completion endpoint returned {status}: {detail}"
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ClientError::Api("completion response had no content".to_string()))
    }
}

/// Z-API `send-text` client. The instance and token are path segments;
/// the client token travels in a header and comes from the environment.
pub struct ZapiGateway {
    client: Client,
    base_url: String,
    instance: String,
    token: String,
    client_token: Option<String>,
}

impl ZapiGateway {
    pub fn from_config(cfg: &Config) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.gateway.timeout_ms))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.gateway.base_url.trim_end_matches('/').to_string(),
            instance: cfg.gateway.instance.clone(),
            token: cfg.gateway.token.clone(),
            client_token: std::env::var(&cfg.gateway.client_token_env).ok(),
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/instances/{}/token/{}/{endpoint}",
            self.base_url, self.instance, self.token
        )
    }
}

#[async_trait]
impl MessageGateway for ZapiGateway {
    async fn send_text(&self, request: &SendTextRequest) -> Result<SendTextResponse, ClientError> {
        let client_token = self
            .client_token
            .as_ref()
            .ok_or_else(|| ClientError::MissingCredential("gateway client token".to_string()))?;

        let response = self
            .client
            .post(self.endpoint_url("send-text"))
            .header("Client-Token", client_token)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!(
                "gateway returned {status}: {detail}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_places_instance_and_token_in_the_path() {
        let gateway = ZapiGateway {
            client: Client::new(),
            base_url: "https://api.z-api.io".to_string(),
            instance: "inst-1".to_string(),
            token: "tok-1".to_string(),
            client_token: None,
        };
        assert_eq!(
            gateway.endpoint_url("send-text"),
            "https://api.z-api.io/instances/inst-1/token/tok-1/send-text"
        );
    }
}
