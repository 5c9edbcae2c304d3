use serde::{Deserialize, Serialize};

use crate::threads::{Message, Role};

use super::directive::strip_history_markers;

/// Most recent history entries replayed to the chat model. Caps request size.
pub const CONTEXT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Non-blank history with image markers removed, limited to the last
/// `CONTEXT_HISTORY_LIMIT` entries.
pub fn clean_history(history: &[Message]) -> Vec<ChatTurn> {
    let cleaned: Vec<ChatTurn> = history
        .iter()
        .filter(|message| !message.is_blank())
        .map(|message| ChatTurn::new(message.role, strip_history_markers(&message.content)))
        .filter(|turn| !turn.content.is_empty())
        .collect();
    let skip = cleaned.len().saturating_sub(CONTEXT_HISTORY_LIMIT);
    cleaned.into_iter().skip(skip).collect()
}

pub fn build_context_window(
    preamble: &str,
    history: &[Message],
    new_message: &Message,
) -> Vec<ChatTurn> {
    let mut window = Vec::with_capacity(CONTEXT_HISTORY_LIMIT + 2);
    window.push(ChatTurn::new(Role::System, preamble));
    window.extend(clean_history(history));
    window.push(ChatTurn::new(new_message.role, new_message.content.clone()));
    window
}
