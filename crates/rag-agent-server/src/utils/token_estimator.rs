/// Token estimation used for the prompt budget.
///
/// Counts grapheme clusters and assumes ~4 characters per token, plus a small
/// per-message overhead for role markers. Deterministic, so truncation
/// decisions are reproducible.
use unicode_segmentation::UnicodeSegmentation;

use crate::models::chat::ChatMessage;

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let graphemes = text.graphemes(true).count();
    graphemes.div_ceil(CHARS_PER_TOKEN).max(1)
}

pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD
}

pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
