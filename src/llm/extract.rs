//! Pull translated code out of a model reply.

use std::sync::OnceLock;

use regex::Regex;

fn fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").expect("fence pattern is valid")
    })
}

/// Prefer the longest ```rust block, then any fenced block, then the raw
/// reply.
pub fn extract_code(reply: &str) -> String {
    let blocks: Vec<(String, String)> = fence()
        .captures_iter(reply)
        .map(|c| {
            (
                c.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default(),
                c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            )
        })
        .collect();

    let rust = blocks
        .iter()
        .filter(|(lang, _)| lang == "rust" || lang == "rs")
        .max_by_key(|(_, body)| body.len());

    let pick = rust.or_else(|| blocks.iter().max_by_key(|(_, body)| body.len()));

    match pick {
        Some((_, body)) => body.trim().to_string(),
        None => reply.trim().to_string(),
    }
}
