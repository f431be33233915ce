use super::types::*;
use crate::error::{AppError, AppResult};
use reqwest::StatusCode;
use std::time::Duration;

/// OpenAI-compatible client for a server reached through a local tunnel
#[derive(Clone)]
pub struct LlmClient {
    endpoint: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(endpoint: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Client for `http://127.0.0.1:<local_port>`
    pub fn for_local_port(local_port: u16, timeout: Duration) -> AppResult<Self> {
        Self::new(&format!("http://127.0.0.1:{}", local_port), timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Status of `GET <route>`
    pub async fn probe_route(&self, route: &str) -> AppResult<StatusCode> {
        let response = self
            .client
            .get(format!("{}{}", self.endpoint, route))
            .send()
            .await?;
        Ok(response.status())
    }

    /// `GET /health` answered with a 2xx
    pub async fn is_healthy(&self) -> bool {
        self.probe_route("/health")
            .await
            .map(|status| status.is_success())
            .unwrap_or(false)
    }

    /// Model ids from `/v1/models`, falling back to Ollama's `/api/tags`
    pub async fn list_models(&self) -> AppResult<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.endpoint))
            .send()
            .await?;

        if response.status().is_success() {
            let list: ModelList = response
                .json()
                .await
                .map_err(|e| AppError::Network(format!("Failed to parse models: {}", e)))?;
            return Ok(list.data.into_iter().map(|m| m.id).collect());
        }

        let response = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Network(format!(
                "Model listing failed with {}",
                response.status()
            )));
        }
        let tags: OllamaTags = response
            .json()
            .await
            .map_err(|e| AppError::Network(format!("Failed to parse models: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Non-streaming chat completion
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
    ) -> AppResult<ChatReply> {
        let request = ChatRequest {
            model,
            messages,
            max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Network(format!("Chat failed {}: {}", status, body)));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Network(format!("Failed to parse response: {}", e)))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AppError::Network("Chat response had no choices".to_string()))?;

        Ok(ChatReply {
            model: if response.model.is_empty() {
                model.to_string()
            } else {
                response.model
            },
            content,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalized() {
        let client = LlmClient::new("http://127.0.0.1:12434/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:12434");
        let local = LlmClient::for_local_port(12434, Duration::from_secs(1)).unwrap();
        assert_eq!(local.endpoint(), "http://127.0.0.1:12434");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = LlmClient::for_local_port(port, Duration::from_millis(500)).unwrap();
        assert!(!client.is_healthy().await);
        assert!(client.list_models().await.is_err());
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = vec![ChatMessage::user("hi")];
        let body = serde_json::to_value(ChatRequest {
            model: "llama2:7b",
            messages: &messages,
            max_tokens: Some(16),
            stream: false,
        })
        .unwrap();
        assert_eq!(body["model"], "llama2:7b");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], false);
    }
}
