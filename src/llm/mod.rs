pub mod backend;
pub mod client;
pub mod extract;
pub mod ollama;
pub mod prompt;

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ProviderError;

pub use backend::LlmBackend;
pub use prompt::LlmPrompt;

/// Uniform request/response contract over any model backend.
///
/// Implementations must be safe to share across worker threads.
pub trait ModelClient: Send + Sync {
    fn query(&self, system: &str, user: &str) -> Result<String, ProviderError>;

    /// Human-readable backend identity, e.g. `openai:gpt-4o`.
    fn name(&self) -> String;
}

/// Map a non-success HTTP response to a provider error.
///
/// The one place quota exhaustion is recognized.
pub fn classify_failure(backend: &str, status: u16, body: &str) -> ProviderError {
    if status == 429 || status == 403 || mentions_quota(body) {
        return ProviderError::QuotaExceeded {
            backend: backend.to_string(),
            detail: format!("HTTP {}: {}", status, truncate(body, 300)),
        };
    }

    ProviderError::Status {
        backend: backend.to_string(),
        status,
        body: truncate(body, 2_000),
    }
}

fn mentions_quota(body: &str) -> bool {
    static QUOTA: OnceLock<Regex> = OnceLock::new();
    QUOTA
        .get_or_init(|| {
            Regex::new(
                r"(?i)insufficient_quota|quota[^.]{0,40}exceeded|allocationquota|exhausted[^.]{0,40}free tier|rate[ _]limit",
            )
            .expect("quota pattern is valid")
        })
        .is_match(body)
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let head: String = s.chars().take(limit).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_is_quota() {
        assert!(classify_failure("openai:x", 429, "{}").is_quota());
        assert!(classify_failure("openai:x", 403, "forbidden").is_quota());
    }

    #[test]
    fn quota_body_on_other_status_is_quota() {
        let body = r#"{"error":{"code":"insufficient_quota","message":"You exceeded your current quota"}}"#;
        assert!(classify_failure("openai:x", 400, body).is_quota());
    }

    #[test]
    fn server_error_is_plain_status() {
        match classify_failure("anthropic:x", 500, "overloaded") {
            ProviderError::Status { status, .. } => assert_eq!(status, 500),
            other => panic!("unexpected {other:?}"),
        }
    }
}
