use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{GenError, Result};

const SERVICE: &str = "ollama";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Result of the pre-flight check done before a chat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Ready,
    NeedsProvisioning,
}

/// The model-serving surface the generator depends on.
pub trait ModelBackend: Send + Sync {
    fn availability(&self, model: &str) -> impl Future<Output = Result<Availability>> + Send;

    fn chat(&self, model: &str, messages: &[ChatMessage]) -> impl Future<Output = Result<String>> + Send;

    /// Downloads `model`, reporting progress fractions in `0.0..=1.0`.
    fn pull(
        &self,
        model: &str,
        on_progress: &mut (dyn FnMut(f32) + Send),
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

#[derive(Debug, Deserialize)]
struct LocalModel {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    name: &'a str,
    stream: bool,
}

/// One line of the NDJSON stream returned by `/api/pull`.
#[derive(Debug, Default, Deserialize)]
pub struct PullStatus {
    #[serde(default)]
    pub status: String,
    pub total: Option<u64>,
    pub completed: Option<u64>,
    pub error: Option<String>,
}

impl PullStatus {
    pub fn fraction(&self) -> Option<f32> {
        match (self.total, self.completed) {
            (Some(total), Some(completed)) if total > 0 => {
                Some((completed as f32 / total as f32).clamp(0.0, 1.0))
            }
            _ if self.status == "success" => Some(1.0),
            _ => None,
        }
    }
}

pub fn parse_pull_line(line: &str) -> Option<PullStatus> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Ollama reports `model "x" not found, try pulling it first`.
pub fn is_missing_model_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("model") && lower.contains("not found")
}

/// `qwen2.5` is installed as `qwen2.5:latest`.
pub fn model_matches(requested: &str, installed: &str) -> bool {
    requested == installed || (!requested.contains(':') && installed == format!("{}:latest", requested))
}

fn parse_chat_body(model: &str, status: u16, body: &str) -> Result<String> {
    let parsed: Option<OllamaChatResponse> = serde_json::from_str(body).ok();

    if let Some(message) = parsed.as_ref().and_then(|r| r.error.as_deref()) {
        if is_missing_model_error(message) {
            return Err(GenError::ModelMissing(model.to_string()));
        }
        return Err(GenError::Status {
            service: SERVICE,
            status,
            body: message.to_string(),
        });
    }

    if !(200..300).contains(&status) {
        return Err(GenError::Status {
            service: SERVICE,
            status,
            body: body.to_string(),
        });
    }

    match parsed.and_then(|r| r.message) {
        Some(message) if !message.content.trim().is_empty() => Ok(message.content),
        Some(_) => Err(GenError::EmptyResponse),
        None => Err(GenError::malformed(SERVICE, "chat response has no message")),
    }
}

pub struct OllamaClient {
    base_url: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn with_config(base_url: String, request_timeout: Duration) -> Self {
        OllamaClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn installed_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(GenError::http(SERVICE))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenError::Status {
                service: SERVICE,
                status,
                body,
            });
        }

        let tags: TagsResponse = response.json().await.map_err(GenError::http(SERVICE))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

impl ModelBackend for OllamaClient {
    async fn availability(&self, model: &str) -> Result<Availability> {
        let installed = self.installed_models().await?;
        if installed.iter().any(|name| model_matches(model, name)) {
            Ok(Availability::Ready)
        } else {
            Ok(Availability::NeedsProvisioning)
        }
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let request = OllamaChatRequest {
            model,
            messages,
            stream: false,
        };

        tracing::debug!(model, messages = messages.len(), "sending chat request");

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(GenError::http(SERVICE))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(GenError::http(SERVICE))?;
        parse_chat_body(model, status, &body)
    }

    async fn pull(&self, model: &str, on_progress: &mut (dyn FnMut(f32) + Send)) -> Result<()> {
        let request = PullRequest {
            model,
            name: model,
            stream: true,
        };

        // Downloads are not bound by the chat timeout.
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(GenError::http(SERVICE))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenError::Pull {
                model: model.to_string(),
                reason: format!("{}: {}", status, body),
            });
        }

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();

        while let Some(item) = stream.next().await {
            let chunk = item.map_err(GenError::http(SERVICE))?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                handle_pull_line(model, &String::from_utf8_lossy(&line), on_progress)?;
            }
        }

        if !pending.is_empty() {
            handle_pull_line(model, &String::from_utf8_lossy(&pending), on_progress)?;
        }

        on_progress(1.0);
        Ok(())
    }
}

fn handle_pull_line(model: &str, line: &str, on_progress: &mut (dyn FnMut(f32) + Send)) -> Result<()> {
    let Some(status) = parse_pull_line(line) else {
        return Ok(());
    };

    if let Some(reason) = status.error {
        return Err(GenError::Pull {
            model: model.to_string(),
            reason,
        });
    }

    if let Some(fraction) = status.fraction() {
        on_progress(fraction);
    }
    tracing::trace!(model, status = %status.status, "pull progress");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_matches_latest_tag() {
        assert!(model_matches("qwen2.5", "qwen2.5:latest"));
        assert!(model_matches("qwen2.5:14b", "qwen2.5:14b"));
        assert!(!model_matches("qwen2.5:14b", "qwen2.5:latest"));
        assert!(!model_matches("llama3.2", "llama3.2:1b"));
    }

    #[test]
    fn test_missing_model_error_detection() {
        assert!(is_missing_model_error("model \"phi3.5\" not found, try pulling it first"));
        assert!(is_missing_model_error("Model Not Found"));
        assert!(!is_missing_model_error("connection refused"));
    }

    #[test]
    fn test_parse_chat_body_success() {
        let body = r#"{"model":"qwen2.5","message":{"role":"assistant","content":"<html></html>"},"done":true}"#;
        assert_eq!(parse_chat_body("qwen2.5", 200, body).unwrap(), "<html></html>");
    }

    #[test]
    fn test_parse_chat_body_missing_model() {
        let body = r#"{"error":"model \"gemma2:27b\" not found, try pulling it first"}"#;
        match parse_chat_body("gemma2:27b", 404, body) {
            Err(GenError::ModelMissing(model)) => assert_eq!(model, "gemma2:27b"),
            other => panic!("expected ModelMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_chat_body_other_errors() {
        assert!(matches!(
            parse_chat_body("m", 500, "upstream exploded"),
            Err(GenError::Status { status: 500, .. })
        ));
        assert!(matches!(
            parse_chat_body("m", 200, r#"{"message":{"content":"   "}}"#),
            Err(GenError::EmptyResponse)
        ));
        assert!(matches!(
            parse_chat_body("m", 200, r#"{"done":true}"#),
            Err(GenError::Malformed { .. })
        ));
    }

    #[test]
    fn test_pull_line_fraction() {
        let status = parse_pull_line(r#"{"status":"pulling abc","total":200,"completed":50}"#).unwrap();
        assert_eq!(status.fraction(), Some(0.25));

        let status = parse_pull_line(r#"{"status":"verifying sha256 digest"}"#).unwrap();
        assert_eq!(status.fraction(), None);

        let status = parse_pull_line(r#"{"status":"success"}"#).unwrap();
        assert_eq!(status.fraction(), Some(1.0));

        assert!(parse_pull_line("   ").is_none());
        assert!(parse_pull_line("not json").is_none());
    }

    #[test]
    fn test_pull_line_error_is_reported() {
        let mut seen = Vec::new();
        let mut record = |f: f32| seen.push(f);
        let result = handle_pull_line("phi3.5", r#"{"error":"pull model manifest: file does not exist"}"#, &mut record);
        assert!(matches!(result, Err(GenError::Pull { .. })));

        handle_pull_line("phi3.5", r#"{"status":"pulling","total":4,"completed":4}"#, &mut record).unwrap();
        assert_eq!(seen, vec![1.0]);
    }
}
