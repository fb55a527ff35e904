//! Conversation History Pruning Module
//!
//! Trims a chat's history to what fits in the model's token budget before it
//! is sent upstream.

use crate::token_counting::TokenEstimator;
use crate::types::{Message, Role};

/// Trims history to a token budget. An empty result means nothing fits.
pub trait TokenBudget: Send + Sync {
    fn trim(&self, messages: &[Message], max_tokens: u32, model: &str) -> Vec<Message>;
}

/// Newest-first trimming on heuristic counts.
///
/// A leading system message is kept when it fits on its own and is placed
/// three positions from the end of the kept window. Otherwise the oldest
/// message is kept only if it still fits after the newer ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicBudget;

impl TokenBudget for HeuristicBudget {
    fn trim(&self, messages: &[Message], max_tokens: u32, model: &str) -> Vec<Message> {
        let limit = max_tokens as usize;
        let Some(first) = messages.first() else {
            return Vec::new();
        };

        let mut kept: Vec<Message> = Vec::new();
        let mut total = 0usize;

        let system_first = first.role == Role::System;
        let mut retain_system = false;
        if system_first {
            let count = TokenEstimator::estimate_message_tokens(first);
            if count < limit {
                total += count;
                retain_system = true;
            }
        }

        for message in messages[1..].iter().rev() {
            let count = TokenEstimator::estimate_message_tokens(message);
            if count + total > limit {
                break;
            }
            total += count;
            kept.insert(0, message.clone());
        }

        if retain_system {
            let at = kept.len().saturating_sub(3);
            kept.insert(at, first.clone());
        } else if !system_first {
            let count = TokenEstimator::estimate_message_tokens(first);
            if count + total < limit {
                kept.insert(0, first.clone());
            }
        }

        tracing::debug!(
            "[BUDGET] Kept {}/{} messages (~{} tokens, limit {} for {})",
            kept.len(),
            messages.len(),
            total,
            limit,
            model
        );
        kept
    }
}
