use crate::constants::{
    DEFAULT_CHECKER_TEMPLATE, PLACEHOLDER_LEGACY_RESPONSE, PLACEHOLDER_LLM_RESPONSE,
    PLACEHOLDER_USER_REQUEST,
};
use crate::types::{Message, Role};

/// Text of the newest user message, parts joined by a blank line.
pub fn last_user_request(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| {
            m.text_parts()
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default()
}

/// Fills the checker template. A template with no placeholders is replaced by
/// a labelled prompt built from the same inputs.
pub fn build_checker_prompt(template: Option<&str>, user_request: &str, response: &str) -> String {
    let template = match template {
        Some(t) if !t.trim().is_empty() => t,
        _ => DEFAULT_CHECKER_TEMPLATE,
    };

    let prompt = template
        .replace(PLACEHOLDER_USER_REQUEST, user_request)
        .replace(PLACEHOLDER_LEGACY_RESPONSE, response)
        .replace(PLACEHOLDER_LLM_RESPONSE, response);

    if prompt != template {
        return prompt;
    }

    tracing::warn!(
        "[AUTO-CHECK] Checker template has no {} or {} placeholder; using the built-in layout",
        PLACEHOLDER_USER_REQUEST,
        PLACEHOLDER_LLM_RESPONSE
    );

    let mut pieces = Vec::with_capacity(3);
    if !user_request.is_empty() {
        pieces.push(format!("The user asked:\n{}", user_request));
    }
    pieces.push(format!("The LLM answered:\n{}", response));
    pieces.push("Improve the answer (Markdown).".to_string());
    pieces.join("\n\n")
}
