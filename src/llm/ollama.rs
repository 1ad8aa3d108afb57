use std::time::Duration;

use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::llm::classify_failure;
use crate::llm::prompt::LlmPrompt;

const DEFAULT_URL: &str = "http://localhost:11434/api/chat";

/// Local Ollama server. No credentials, no quota.
#[derive(Clone)]
pub struct Ollama {
    model: String,
    url: String,
    temperature: Option<f32>,
    http: reqwest::blocking::Client,
}

impl Ollama {
    pub fn new(cfg: &LlmConfig) -> Result<Self, ProviderError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            model: cfg.model.clone(),
            url: cfg.base_url.clone().unwrap_or_else(|| DEFAULT_URL.into()),
            temperature: cfg.temperature,
            http,
        })
    }

    pub fn label(&self) -> String {
        format!("ollama:{}", self.model)
    }

    pub fn run(&self, prompt: &LlmPrompt) -> Result<String, ProviderError> {
        let backend = self.label();

        let mut body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user }
            ]
        });
        if let Some(t) = self.temperature {
            body["options"] = json!({ "temperature": t });
        }

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| ProviderError::Transport {
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

        let v: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Malformed {
            backend: backend.clone(),
            detail: e.to_string(),
        })?;

        v.pointer("/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ProviderError::Malformed {
                backend,
                detail: "missing message.content".into(),
            })
    }
}
