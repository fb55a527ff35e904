//! Token Counting Utility
//!
//! Heuristic token counts for trimming history to a model's budget.

use crate::types::{ContentPart, ImageDetail, Message};

/// Estimator for token counts to avoid shipping a BPE tokenizer.
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate_total_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message_tokens).sum()
    }

    pub fn estimate_message_tokens(message: &Message) -> usize {
        let mut tokens = 4; // role + framing overhead

        for part in &message.content {
            tokens += match part {
                ContentPart::Text { text } => Self::estimate_text_tokens(text),
                ContentPart::ImageUrl { image_url } => match image_url.detail {
                    ImageDetail::Low => 85,
                    ImageDetail::Auto | ImageDetail::High => 765,
                },
            }
        }

        tokens
    }

    /// Conservative: 3 chars per token.
    pub fn estimate_text_tokens(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() / 3).max(1)
    }
}
