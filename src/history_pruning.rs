//! Conversation History Truncation
//!
//! Reduces an ordered conversation to a character budget before it is sent
//! upstream. The leading system turn is always kept; the oldest remaining turns
//! are dropped first. The last non-system turn is never dropped, so the model
//! always has something to answer even when a single message exceeds the budget.

use crate::constants::TRUNCATION_MARKER;
use crate::types::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationOutcome {
    pub turns: Vec<ChatMessage>,
    pub was_truncated: bool,
    pub removed_count: usize,
}

/// Total length of a conversation, in characters.
pub fn total_chars(turns: &[ChatMessage]) -> usize {
    turns.iter().map(ChatMessage::char_len).sum()
}

/// Drops the oldest non-system turns until the conversation fits `limit`.
pub fn truncate(turns: &[ChatMessage], limit: usize) -> TruncationOutcome {
    if turns.len() <= 2 {
        return TruncationOutcome {
            turns: turns.to_vec(),
            was_truncated: false,
            removed_count: 0,
        };
    }

    let mut total = total_chars(turns);
    let mut removed = 0usize;
    // Index 1 onward, oldest first; stop before the final turn.
    for turn in &turns[1..turns.len() - 1] {
        if total <= limit {
            break;
        }
        total -= turn.char_len();
        removed += 1;
    }

    if removed == 0 {
        return TruncationOutcome {
            turns: turns.to_vec(),
            was_truncated: false,
            removed_count: 0,
        };
    }

    let mut kept = Vec::with_capacity(turns.len() - removed);
    kept.push(turns[0].clone());
    kept.extend_from_slice(&turns[1 + removed..]);

    TruncationOutcome {
        turns: kept,
        was_truncated: true,
        removed_count: removed,
    }
}

/// Appends the omission note to the system turn. Callers apply this only when
/// `truncate` reported a removal.
pub fn apply_truncation_marker(outcome: &mut TruncationOutcome) {
    if !outcome.was_truncated {
        return;
    }
    if let Some(system) = outcome.turns.first_mut() {
        system.content.push_str(TRUNCATION_MARKER);
    }
}
