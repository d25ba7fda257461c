//! Local model client for an Ollama-compatible server.
//!
//! - `GET /api/tags`: availability probe and model list (200 = available)
//! - `POST /api/chat` with `stream: false`: one-shot chat completion
//!
//! A 404 from the chat endpoint means the configured model is not installed.

use async_trait::async_trait;
use senseloop_config::LocalModelConfig;
use senseloop_core::error::LocalModelError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// The local tier of the fallback chain.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Quick probe; must not hang.
    async fn is_available(&self) -> bool;

    async fn chat(&self, prompt: &str) -> Result<String, LocalModelError>;
}

pub struct LocalModelClient {
    base_url: String,
    model: String,
    timeout: Duration,
    probe_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl LocalModelClient {
    pub fn new(config: &LocalModelConfig) -> Result<Self, LocalModelError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LocalModelError::Unreachable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Names of the installed models.
    pub async fn list_models(&self) -> Result<Vec<String>, LocalModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, self.probe_timeout))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(LocalModelError::Http { status });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| LocalModelError::InvalidResponse(format!("Failed to parse model list: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn transport_error(&self, e: reqwest::Error, limit: Duration) -> LocalModelError {
        if e.is_timeout() {
            LocalModelError::Timeout {
                timeout_secs: limit.as_secs(),
            }
        } else {
            LocalModelError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
impl LocalBackend for LocalModelClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn is_available(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Local model server unavailable");
                false
            }
        }
    }

    async fn chat(&self, prompt: &str) -> Result<String, LocalModelError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        debug!(model = %self.model, "Sending local chat request");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, self.timeout))?;

        let status = response.status().as_u16();

        if status == 404 {
            return Err(LocalModelError::ModelNotInstalled(self.model.clone()));
        }

        if status != 200 {
            warn!(status, "Local model server returned error");
            return Err(LocalModelError::Http { status });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LocalModelError::InvalidResponse(format!("Failed to parse response: {e}")))?;
        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::{Value, json};

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, model: &str) -> LocalModelClient {
        LocalModelClient::new(&LocalModelConfig {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 5,
            probe_timeout_secs: 2,
            ..LocalModelConfig::default()
        })
        .unwrap()
    }

    fn ollama() -> Router {
        Router::new()
            .route(
                "/api/tags",
                get(|| async { Json(json!({"models": [{"name": "llama3.2:latest"}]})) }),
            )
            .route(
                "/api/chat",
                post(|Json(body): Json<Value>| async move {
                    if body["model"] != "llama3.2" {
                        return (StatusCode::NOT_FOUND, Json(json!({"error": "model not found"})));
                    }
                    assert_eq!(body["stream"], false);
                    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
                    (
                        StatusCode::OK,
                        Json(json!({
                            "message": {"role": "assistant", "content": format!("echo: {prompt}")},
                            "done": true
                        })),
                    )
                }),
            )
    }

    #[tokio::test]
    async fn available_and_chats() {
        let url = spawn_server(ollama()).await;
        let local = client(&url, "llama3.2");
        assert!(local.is_available().await);
        assert_eq!(local.list_models().await.unwrap(), vec!["llama3.2:latest"]);
        assert_eq!(local.chat("hi").await.unwrap(), "echo: hi");
    }

    #[tokio::test]
    async fn missing_model_is_reported() {
        let url = spawn_server(ollama()).await;
        let local = client(&url, "mistral");
        let err = local.chat("hi").await.unwrap_err();
        assert!(matches!(err, LocalModelError::ModelNotInstalled(m) if m == "mistral"));
    }

    #[tokio::test]
    async fn server_error_maps_to_http() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let url = spawn_server(app).await;
        let err = client(&url, "llama3.2").chat("hi").await.unwrap_err();
        assert!(matches!(err, LocalModelError::Http { status: 503 }));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let local = client(&format!("http://{addr}"), "llama3.2");
        assert!(!local.is_available().await);
        assert!(matches!(
            local.chat("hi").await.unwrap_err(),
            LocalModelError::Unreachable(_)
        ));
    }
}
