// src/llm/client.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{LlmConfig, ProviderKind};
use crate::error::ProviderError;
use crate::llm::classify_failure;
use crate::llm::prompt::LlmPrompt;

const PROMPT_ABI_VERSION: &str = "v1-translate-repair";

/// Remote HTTP backend: OpenAI-compatible chat completions or Anthropic
/// messages. Stateless per call apart from a request counter.
#[derive(Clone)]
pub struct LlmClient {
    cfg: Arc<LlmConfig>,
    api_key: String,
    http: reqwest::blocking::Client,
    requests: Arc<AtomicU64>,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, ProviderError> {
        if cfg.provider == ProviderKind::Ollama {
            return Err(ProviderError::Config(
                "ollama is served by the local backend, not the remote client".into(),
            ));
        }

        let api_key = cfg.resolve_api_key().ok_or_else(|| {
            ProviderError::Config(format!(
                "no API key for {:?} (set llm.api_key or {})",
                cfg.provider,
                cfg.api_key_env.as_deref().unwrap_or("llm.api_key_env")
            ))
        })?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            cfg: Arc::new(cfg),
            api_key,
            http,
            requests: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn label(&self) -> String {
        let provider = match self.cfg.provider {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
        };
        format!("{}:{}", provider, self.cfg.model)
    }

    /// Execute one completion request.
    pub fn run(&self, prompt: &LlmPrompt) -> Result<String, ProviderError> {
        let backend = self.label();
        let (url, headers, body) = build_request(&self.cfg, &self.api_key, prompt);

        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(backend = %backend, request = n, prompt_hash = %hash_prompt(prompt), "sending completion request");

        let mut req = self.http.post(url).json(&body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req.send().map_err(|e| ProviderError::Transport {
            backend: backend.clone(),
            detail: e.to_string(),
        })?;

        let status = resp.status();
        let text = resp.text().map_err(|e| ProviderError::Transport {
            backend: backend.clone(),
            detail: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(classify_failure(&backend, status.as_u16(), &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Malformed {
            backend: backend.clone(),
            detail: e.to_string(),
        })?;

        extract_text(self.cfg.provider, &json).ok_or_else(|| ProviderError::Malformed {
            backend,
            detail: format!("no completion text in response: {}", truncate_json(&json)),
        })
    }
}

pub fn hash_prompt(prompt: &LlmPrompt) -> String {
    let mut h = Sha256::new();
    h.update(PROMPT_ABI_VERSION.as_bytes());
    h.update(prompt.system.as_bytes());
    h.update(prompt.user.as_bytes());
    hex::encode(h.finalize())
}

fn build_request(
    cfg: &LlmConfig,
    api_key: &str,
    prompt: &LlmPrompt,
) -> (String, Vec<(&'static str, String)>, Value) {
    match cfg.provider {
        ProviderKind::OpenAI | ProviderKind::Ollama => {
            let url = chat_completions_url(cfg.base_url.as_deref());

            let messages = if cfg.system_in_user {
                serde_json::json!([
                    { "role": "user", "content": format!("{}\n\n{}", prompt.system, prompt.user) }
                ])
            } else {
                serde_json::json!([
                    { "role": "system", "content": prompt.system },
                    { "role": "user", "content": prompt.user }
                ])
            };

            let mut body = serde_json::json!({
                "model": cfg.model,
                "messages": messages,
                "max_tokens": cfg.max_tokens,
            });

            if let Some(t) = cfg.temperature {
                body["temperature"] = t.into();
            }

            (
                url,
                vec![("Authorization", format!("Bearer {}", api_key))],
                body,
            )
        }

        ProviderKind::Anthropic => {
            let url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into());

            let mut body = serde_json::json!({
                "model": cfg.model,
                "max_tokens": cfg.max_tokens,
                "system": prompt.system,
                "messages": [
                    { "role": "user", "content": prompt.user }
                ]
            });

            if let Some(t) = cfg.temperature {
                body["temperature"] = t.into();
            }

            (
                url,
                vec![
                    ("x-api-key", api_key.to_string()),
                    ("anthropic-version", "2023-06-01".into()),
                ],
                body,
            )
        }
    }
}

fn chat_completions_url(base: Option<&str>) -> String {
    match base {
        None => "https://api.openai.com/v1/chat/completions".into(),
        Some(b) if b.trim_end_matches('/').ends_with("/chat/completions") => b.to_string(),
        Some(b) => format!("{}/chat/completions", b.trim_end_matches('/')),
    }
}

fn extract_text(provider: ProviderKind, v: &Value) -> Option<String> {
    match provider {
        ProviderKind::OpenAI | ProviderKind::Ollama => v
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_owned),

        ProviderKind::Anthropic => v.get("content").and_then(Value::as_array).and_then(|parts| {
            let text: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join(""))
        }),
    }
}

fn truncate_json(v: &Value) -> String {
    let s = v.to_string();
    if s.chars().count() > 300 {
        format!("{}...", s.chars().take(300).collect::<String>())
    } else {
        s
    }
}
