use thiserror::Error;

/// Operator-visible command failures.
///
/// `Validation` and `Execution` map straight onto reply text; anything else
/// is surfaced as a generic failure and logged with full context.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),
    #[error("command failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn validation(message: impl Into<String>) -> CommandError {
    CommandError::Validation(message.into())
}
