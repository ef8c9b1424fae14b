//! Token budget estimation for a message history.
//!
//! Uses the chars/4 heuristic rather than a real tokenizer.

use serde::Serialize;

use crate::domain::message::ChatMessage;

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Role and formatting overhead charged per message.
pub const PER_MESSAGE_OVERHEAD: u64 = 4;

const COMPACT_RATIO: f64 = 0.70;
const BLOCK_RATIO: f64 = 0.95;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ContextEvaluation {
    pub tokens: u64,
    pub max: u64,
    pub should_compact: bool,
    pub should_block: bool,
}

pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u64 {
    messages.iter().map(|message| estimate_tokens(&message.content) + PER_MESSAGE_OVERHEAD).sum()
}

/// Evaluates `messages` against `context_window` tokens, or
/// [`DEFAULT_CONTEXT_WINDOW`] when none is given. Advisory only.
pub fn evaluate_context(messages: &[ChatMessage], context_window: Option<u64>) -> ContextEvaluation {
    let max = context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
    let tokens = estimate_messages_tokens(messages);
    let budget = max as f64;

    ContextEvaluation {
        tokens,
        max,
        should_compact: tokens as f64 > budget * COMPACT_RATIO,
        should_block: tokens as f64 > budget * BLOCK_RATIO,
    }
}
