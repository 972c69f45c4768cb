use std::collections::BTreeMap;
use std::time::Instant;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use testloom_kernel::message::{Message, MessageRole};

use super::{CompletionParams, Provider, ProviderError, ProviderFuture};
use crate::response::CompletionResponse;

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Client for any OpenAI-compatible `chat/completions` endpoint
/// (OpenRouter, OpenAI, a local llama.cpp or Ollama server).
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    headers: BTreeMap<String, String>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            headers: BTreeMap::new(),
        }
    }

    /// Extra headers sent with every request (e.g. OpenRouter's
    /// `HTTP-Referer` / `X-Title` attribution headers).
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Provider for OpenAiProvider {
    fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &CompletionParams,
    ) -> ProviderFuture<'_> {
        let model = model.to_string();
        let messages = messages.to_vec();
        let params = *params;

        Box::pin(async move {
            let oai_messages: Vec<OaiMessage> = messages
                .iter()
                .map(|m| OaiMessage {
                    role: match m.role {
                        MessageRole::System => "system".into(),
                        MessageRole::User => "user".into(),
                        MessageRole::Assistant => "assistant".into(),
                    },
                    content: m.content.clone(),
                })
                .collect();

            let body = OaiRequest {
                model: &model,
                messages: &oai_messages,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
            };

            let start = Instant::now();

            let mut req = self
                .client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("content-type", "application/json");
            for (name, value) in &self.headers {
                req = req.header(name.as_str(), value.as_str());
            }

            let resp = req.json(&body).send().await?;

            let latency_ms = start.elapsed().as_millis() as u64;
            let status = resp.status().as_u16();

            if status == 429 {
                return Err(ProviderError::RateLimited {
                    retry_after_ms: resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|s| s * 1000),
                });
            }

            let resp_text = resp.text().await?;

            if status >= 400 {
                return Err(ProviderError::Api {
                    status,
                    body: resp_text,
                });
            }

            let parsed: OaiResponse = serde_json::from_str(&resp_text)
                .map_err(|e| ProviderError::Parse(format!("{e}: {resp_text}")))?;

            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or(ProviderError::NoChoices)?;

            let content = choice.message.content.unwrap_or_default();
            let usage = parsed.usage.unwrap_or_default();

            Ok(CompletionResponse {
                content,
                model: parsed.model.unwrap_or(model),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                latency_ms,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OaiRequest<'a> {
    model: &'a str,
    messages: &'a [OaiMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OaiResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Deserialize)]
struct OaiChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use testloom_kernel::message::CompletionRequest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    /// Read one HTTP request (headers plus `Content-Length` body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// One-shot mock server. The request it received is sent back on the
    /// returned channel.
    async fn mock_server(status: u16, body: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");
        let status_line = match status {
            200 => "200 OK",
            401 => "401 Unauthorized",
            429 => "429 Too Many Requests",
            _ => "500 Internal Server Error",
        };
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let _ = tx.send(request);
            let resp = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nRetry-After: 2\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });
        (url, rx)
    }

    fn test_messages() -> Vec<Message> {
        CompletionRequest::new("System prompt", "Hello").to_messages()
    }

    #[tokio::test]
    async fn complete_success() {
        let body = serde_json::json!({
            "model": "deepseek/deepseek-r1",
            "choices": [{"message": {"content": "```cpp\nTEST(A, B) {}\n```"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        });
        let (url, _rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let response = provider
            .complete("deepseek/deepseek-r1", &test_messages(), &CompletionParams::default())
            .await
            .unwrap();
        // The provider returns raw text; fence stripping happens in the client.
        assert!(response.content.starts_with("```cpp"));
        assert_eq!(response.model, "deepseek/deepseek-r1");
        assert_eq!(response.prompt_tokens, 100);
        assert_eq!(response.completion_tokens, 50);
        assert_eq!(response.total_tokens, 150);
    }

    #[tokio::test]
    async fn complete_without_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        let (url, _rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let response = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.total_tokens, 0);
        assert_eq!(response.model, "m");
    }

    #[tokio::test]
    async fn complete_empty_choices() {
        let body = serde_json::json!({"choices": []});
        let (url, _rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::NoChoices)));
    }

    #[tokio::test]
    async fn complete_missing_choices_field() {
        // OpenRouter reports some upstream failures as a 200 with only an
        // `error` object.
        let body = serde_json::json!({"error": {"message": "upstream", "code": 502}});
        let (url, _rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::NoChoices)));
    }

    #[tokio::test]
    async fn complete_null_content_is_empty() {
        let body = serde_json::json!({"choices": [{"message": {"content": null}}]});
        let (url, _rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let response = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await
            .unwrap();
        assert!(response.content.is_empty());
    }

    #[tokio::test]
    async fn complete_rate_limited() {
        let (url, _rx) = mock_server(429, "{}".into()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::RateLimited {
                retry_after_ms: Some(2000)
            })
        ));
    }

    #[tokio::test]
    async fn complete_api_error() {
        let (url, _rx) = mock_server(500, r#"{"error": "internal"}"#.into()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Api { status: 500, .. })));
    }

    #[tokio::test]
    async fn complete_unauthorized() {
        let (url, _rx) = mock_server(401, r#"{"error": "bad key"}"#.into()).await;
        let provider = OpenAiProvider::new("wrong".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Api { status: 401, .. })));
    }

    #[tokio::test]
    async fn complete_garbage_body() {
        let (url, _rx) = mock_server(200, "not json".into()).await;
        let provider = OpenAiProvider::new("test-key".into(), url);
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Parse(_))));
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = OpenAiProvider::new("k".into(), format!("http://{addr}"));
        let result = provider
            .complete("m", &test_messages(), &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Http(_))));
    }

    #[tokio::test]
    async fn request_carries_auth_headers_and_messages() {
        let body = serde_json::json!({"choices": [{"message": {"content": "ok"}}]});
        let (url, rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("sk-test".into(), url).with_headers(BTreeMap::from([
            ("HTTP-Referer".to_string(), "https://example.com/loom".to_string()),
            ("X-Title".to_string(), "testloom".to_string()),
        ]));
        provider
            .complete("some/model", &test_messages(), &CompletionParams::default())
            .await
            .unwrap();

        let request = rx.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer sk-test"));
        assert!(lower.contains("http-referer: https://example.com/loom"));
        assert!(lower.contains("x-title: testloom"));

        let body_start = request.find("\r\n\r\n").unwrap() + 4;
        let json: serde_json::Value = serde_json::from_str(&request[body_start..]).unwrap();
        assert_eq!(json["model"], "some/model");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "System prompt");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Hello");
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn request_includes_set_params() {
        let body = serde_json::json!({"choices": [{"message": {"content": "ok"}}]});
        let (url, rx) = mock_server(200, body.to_string()).await;
        let provider = OpenAiProvider::new("k".into(), url);
        let params = CompletionParams {
            temperature: Some(0.5),
            max_tokens: Some(2048),
        };
        provider
            .complete("m", &test_messages(), &params)
            .await
            .unwrap();

        let request = rx.await.unwrap();
        let body_start = request.find("\r\n\r\n").unwrap() + 4;
        let json: serde_json::Value = serde_json::from_str(&request[body_start..]).unwrap();
        assert_eq!(json["max_tokens"], 2048);
        assert!((json["temperature"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }
}
