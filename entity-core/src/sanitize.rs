//! Turn raw provider/transport errors into messages safe to show a user

use serde::{Deserialize, Serialize};

/// Longest message passed through for uncategorized errors
const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ConnectionFailed,
    EndpointNotFound,
    ConnectionRefused,
    Generic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedError {
    pub category: ErrorCategory,
    pub message: String,
}

pub fn sanitize_error(raw: &str) -> SanitizedError {
    let lower = raw.to_lowercase();

    let (category, message) = if lower.contains("econnrefused") || lower.contains("connection refused") {
        (
            ErrorCategory::ConnectionRefused,
            "The AI service refused the connection. Check that it is running.".to_string(),
        )
    } else if lower.contains("404") || lower.contains("not found") {
        (
            ErrorCategory::EndpointNotFound,
            "The AI service endpoint was not found. Check the configured base URL.".to_string(),
        )
    } else if lower.contains("error sending request")
        || lower.contains("dns error")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("failed to connect")
    {
        (
            ErrorCategory::ConnectionFailed,
            "Could not connect to the AI service.".to_string(),
        )
    } else {
        let cleaned = clean(raw);
        let message = if cleaned.is_empty() {
            "An unexpected error occurred.".to_string()
        } else {
            cleaned
        };
        (ErrorCategory::Generic, message)
    };

    SanitizedError { category, message }
}

/// Remove markup and stack frames, collapse whitespace, bound the length
fn clean(raw: &str) -> String {
    let text = strip_tags(raw);
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_stack_line(line))
        .collect();
    let collapsed = kept.join(" ").split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_MESSAGE_CHARS {
        let mut cut: String = collapsed.chars().take(MAX_MESSAGE_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        collapsed
    }
}

fn strip_tags(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_stack_line(line: &str) -> bool {
    line.starts_with("at ")
        || line.starts_with("stack backtrace")
        || line.starts_with("Stack backtrace")
        || line.contains(".rs:")
        || line.contains(".js:")
        || line
            .split_once(':')
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}
