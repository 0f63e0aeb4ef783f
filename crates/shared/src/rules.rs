use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const EDIT_WINDOW_MINUTES: i64 = 15;
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "[Message deleted]";
pub const TYPING_IDLE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    #[error("message content cannot be empty")]
    EmptyContent,
    #[error("message is too long: {actual} characters, maximum {max}")]
    ContentTooLong { max: usize, actual: usize },
    #[error("message is too old to edit; edit window is {EDIT_WINDOW_MINUTES} minutes")]
    EditWindowClosed,
    #[error("cannot open a direct thread with yourself")]
    SelfDirectThread,
}

/// Returns the content to persist (trimmed) or the rule it breaks.
pub fn validate_message_content(raw: &str) -> Result<String, RuleViolation> {
    let actual = raw.chars().count();
    if actual > MAX_MESSAGE_CHARS {
        return Err(RuleViolation::ContentTooLong {
            max: MAX_MESSAGE_CHARS,
            actual,
        });
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RuleViolation::EmptyContent);
    }
    Ok(trimmed.to_string())
}

/// The window is exclusive at its end: a message exactly 15 minutes old can
/// still be edited, one millisecond later it cannot.
pub fn ensure_edit_window(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), RuleViolation> {
    if now - created_at > Duration::minutes(EDIT_WINDOW_MINUTES) {
        return Err(RuleViolation::EditWindowClosed);
    }
    Ok(())
}
