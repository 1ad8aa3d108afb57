use crate::config::{LlmConfig, ProviderKind};
use crate::error::ProviderError;
use crate::llm::client::LlmClient;
use crate::llm::ollama::Ollama;
use crate::llm::prompt::LlmPrompt;
use crate::llm::ModelClient;

/// Config-selected concrete backend.
#[derive(Clone)]
pub enum LlmBackend {
    Ollama { server: Ollama },
    Remote { client: LlmClient },
}

impl LlmBackend {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, ProviderError> {
        match cfg.provider {
            ProviderKind::Ollama => Ok(LlmBackend::Ollama {
                server: Ollama::new(cfg)?,
            }),
            ProviderKind::OpenAI | ProviderKind::Anthropic => Ok(LlmBackend::Remote {
                client: LlmClient::new(cfg.clone())?,
            }),
        }
    }
}

impl ModelClient for LlmBackend {
    fn query(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let prompt = LlmPrompt {
            system: system.to_string(),
            user: user.to_string(),
        };

        match self {
            LlmBackend::Ollama { server } => server.run(&prompt),
            LlmBackend::Remote { client } => client.run(&prompt),
        }
    }

    fn name(&self) -> String {
        match self {
            LlmBackend::Ollama { server } => server.label(),
            LlmBackend::Remote { client } => client.label(),
        }
    }
}
