use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::ValueEnum;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::modules::config::LlmSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Local Ollama server (`/api/chat`)
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions`
    Openai,
}

impl LlmProvider {
    pub fn label(self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Openai => "openai",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub system_prompt: String,
    pub user_input: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    /// Nothing to call: no credentials, connection refused, timeouts.
    #[error("generation unavailable: {0}")]
    Unavailable(String),
    /// The provider answered but the answer was unusable.
    #[error("provider error: {0}")]
    Provider(String),
}

/// External text generation capability.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, params: &GenerationParams) -> Result<String, GenerateError>;
}

/// Generator used when no provider is configured. Every call fails, so the
/// request worker answers with scripted lines instead.
#[derive(Debug, Clone, Default)]
pub struct OfflineGenerator;

impl TextGenerator for OfflineGenerator {
    fn generate(&self, _params: &GenerationParams) -> Result<String, GenerateError> {
        Err(GenerateError::Unavailable("no LLM credentials configured".into()))
    }
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    host: String,
    model: String,
    provider: LlmProvider,
    api_key: Option<String>,
    max_attempts: u32,
    log_path: Option<PathBuf>,
    http: Client,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, GenerateError> {
        let http = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| GenerateError::Unavailable(format!("http client: {}", e)))?;

        Ok(Self {
            host: settings.host.clone(),
            model: settings.model.clone(),
            provider: settings.provider,
            api_key: settings.api_key.clone(),
            max_attempts: settings.max_attempts.max(1),
            log_path: settings.log_path.clone(),
            http,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn call_once(&self, params: &GenerationParams) -> Result<Exchange, GenerateError> {
        match self.provider {
            LlmProvider::Ollama => self.call_ollama(params),
            LlmProvider::Openai => self.call_openai(params),
        }
    }

    fn call_ollama(&self, params: &GenerationParams) -> Result<Exchange, GenerateError> {
        let url = format!("{}/api/chat", self.host.trim_end_matches('/'));
        let body = ChatRequest {
            model: self.model.clone(),
            stream: false,
            messages: build_chat_messages(params),
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        };

        let (request_json, raw_body) = self.post(&url, &body, None)?;
        let parsed: ChatResponse = serde_json::from_str(&raw_body)
            .map_err(|e| GenerateError::Provider(format!("decode: {}; body={}", e, truncate(&raw_body, 200))))?;

        Ok(Exchange {
            request_json,
            response_json: raw_body,
            text: parsed.message.content,
        })
    }

    fn call_openai(&self, params: &GenerationParams) -> Result<Exchange, GenerateError> {
        let url = {
            let trimmed = self.host.trim_end_matches('/');
            if trimmed.ends_with("/v1/chat/completions") {
                trimmed.to_string()
            } else {
                format!("{}/v1/chat/completions", trimmed)
            }
        };

        let body = OpenAiChatRequest {
            model: self.model.clone(),
            stream: false,
            temperature: Some(params.temperature),
            max_tokens: Some(params.max_tokens),
            messages: build_chat_messages(params),
        };

        let headers = build_openai_headers(self.api_key.as_deref())?;
        let (request_json, raw_body) = self.post(&url, &body, Some(headers))?;
        let parsed: OpenAiChatResponse = serde_json::from_str(&raw_body)
            .map_err(|e| GenerateError::Provider(format!("decode: {}; body={}", e, truncate(&raw_body, 200))))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        Ok(Exchange {
            request_json,
            response_json: raw_body,
            text,
        })
    }

    fn post<B: Serialize>(
        &self,
        url: &str,
        body: &B,
        headers: Option<reqwest::header::HeaderMap>,
    ) -> Result<(String, String), GenerateError> {
        let request_json = serde_json::to_string_pretty(body)
            .map_err(|e| GenerateError::Provider(format!("encode request: {}", e)))?;

        let mut request = self.http.post(url).json(body);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        let resp = request
            .send()
            .map_err(|e| GenerateError::Unavailable(format!("http: {}", e)))?;
        let status = resp.status();
        let raw_body = resp
            .text()
            .map_err(|e| GenerateError::Unavailable(format!("read body: {}", e)))?;

        if !status.is_success() {
            let message = format!("status={} body={}", status, truncate(&raw_body, 200));
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                GenerateError::Unavailable(message)
            } else {
                GenerateError::Provider(message)
            });
        }
        Ok((request_json, raw_body))
    }

    fn log_call(&self, request_json: &str, response_json: &str) {
        let Some(path) = &self.log_path else {
            return;
        };
        if let Some(dir) = path.parent() {
            if let Err(err) = fs::create_dir_all(dir) {
                warn!(error = %err, "failed to create llm log dir");
                return;
            }
        }
        let content = format!(
            "[{}] provider={} model={}\nrequest:\n{}\nresponse:\n{}\n\n",
            Utc::now().to_rfc3339(),
            self.provider.label(),
            self.model,
            request_json,
            response_json
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(content.as_bytes()));
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "failed to write llm log");
        }
    }
}

impl TextGenerator for LlmClient {
    /// Calls the provider, retrying with a short jitter between attempts.
    fn generate(&self, params: &GenerationParams) -> Result<String, GenerateError> {
        let mut attempts = 0;
        let mut last_err = GenerateError::Unavailable("no attempt made".into());

        while attempts < self.max_attempts {
            attempts += 1;
            if attempts > 1 {
                // 50-150ms
                let jitter_ms = 50 + (rand::random::<u64>() % 100);
                std::thread::sleep(Duration::from_millis(jitter_ms));
            }

            match self.call_once(params) {
                Ok(exchange) => {
                    self.log_call(&exchange.request_json, &exchange.response_json);
                    let text = exchange.text.trim();
                    if text.is_empty() {
                        last_err = GenerateError::Provider("empty completion".into());
                        continue;
                    }
                    debug!(
                        provider = self.provider.label(),
                        attempts,
                        reply = %truncate(text, 80),
                        "llm call succeeded"
                    );
                    return Ok(text.to_string());
                }
                Err(err) => {
                    debug!(provider = self.provider.label(), attempts, error = %err, "llm call failed");
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }
}

fn build_chat_messages(params: &GenerationParams) -> Vec<Message> {
    vec![
        Message {
            role: "system".into(),
            content: params.system_prompt.clone(),
        },
        Message {
            role: "user".into(),
            content: params.user_input.clone(),
        },
    ]
}

fn build_openai_headers(api_key: Option<&str>) -> Result<reqwest::header::HeaderMap, GenerateError> {
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
    let Some(key) = api_key.filter(|k| !k.is_empty()) else {
        return Err(GenerateError::Unavailable(
            "missing LLM API key; set --llm-api-key or ISKRA_LLM_API_KEY".into(),
        ));
    };
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let value = HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|e| GenerateError::Unavailable(format!("invalid api key: {}", e)))?;
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

struct Exchange {
    request_json: String,
    response_json: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

/// Shortens `text` to `max` chars on a char boundary.
pub fn truncate(text: &str, max: usize) -> String {
    let mut chars = text.char_indices();
    let cutoff = match chars.nth(max) {
        Some((idx, _)) => idx,
        None => return text.to_string(),
    };
    format!("{}...", &text[..cutoff])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("привет мир", 6), "привет...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn openai_headers_require_a_key() {
        assert!(matches!(
            build_openai_headers(None),
            Err(GenerateError::Unavailable(_))
        ));
        assert!(matches!(
            build_openai_headers(Some("")),
            Err(GenerateError::Unavailable(_))
        ));
        let headers = build_openai_headers(Some("sk-test")).unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-test");
    }

    #[test]
    fn offline_generator_is_unavailable() {
        let params = GenerationParams {
            system_prompt: "s".into(),
            user_input: "u".into(),
            temperature: 0.9,
            max_tokens: 10,
        };
        assert!(matches!(
            OfflineGenerator.generate(&params),
            Err(GenerateError::Unavailable(_))
        ));
    }

    #[test]
    fn client_without_key_fails_without_network() {
        let settings = LlmSettings {
            max_attempts: 1,
            log_path: None,
            ..LlmSettings::default()
        };
        let client = LlmClient::new(&settings).unwrap();
        let params = GenerationParams {
            system_prompt: "s".into(),
            user_input: "u".into(),
            temperature: 0.9,
            max_tokens: 10,
        };
        assert!(matches!(
            client.generate(&params),
            Err(GenerateError::Unavailable(_))
        ));
    }
}
