// Error types and user-friendly error messages
//
// Typed errors for configuration and snapshot decoding, plus helpers that
// turn technical failures into messages pointing at a fix.

use anyhow::{Context, Result};
use std::fmt;
use thiserror::Error;

/// Errors raised while building the immutable run configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("malformed override {0:?}: expected KEY=VALUE")]
    MalformedOverride(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while decoding a persisted trainer snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error("snapshot has no schema version field")]
    MissingVersion,

    #[error("snapshot holds {found} episodes but the configured batch size is {expected}")]
    BatchSizeMismatch { found: usize, expected: usize },

    #[error("snapshot is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Wrap an error with user-friendly context
pub trait UserFriendlyError {
    /// Add user-friendly context to this error
    fn user_context(self, message: &str) -> Self;

    /// Add user-friendly context with a suggestion
    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self;
}

impl<T> UserFriendlyError for Result<T> {
    fn user_context(self, message: &str) -> Self {
        self.with_context(|| message.to_string())
    }

    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self {
        self.with_context(|| wrap_error_with_suggestion(problem, suggestion))
    }
}

/// Format a checkpoint restore error with helpful suggestions
pub fn checkpoint_restore_error(path: &str) -> String {
    format!(
        "Failed to restore trainer checkpoint from {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Checkpoint written by a newer build\n\
        • File truncated by an interrupted save\n\
        • Batch size changed since the checkpoint was taken\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Inspect the snapshot header:\n\
           \x1b[36mhead -c 200 {}\x1b[0m\n\n\
        2. Move the newest epoch directory aside to resume from an older one:\n\
           \x1b[36mmv $(dirname \"{}\") $(dirname \"{}\").bad\x1b[0m",
        path, path, path, path
    )
}

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(path: &str) -> String {
    format!(
        "Failed to parse config file {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check config file syntax:\n\
           \x1b[36mcat {}\x1b[0m\n\n\
        2. Common mistakes:\n\
           • Misspelled parameter names (unknown keys are rejected)\n\
           • Integers where a list is expected (task_space.xlim = [-6.0, 6.0])\n\
           • Unclosed brackets []",
        path, path
    )
}

/// Wrap a generic error with suggestions
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!("{}\n\n\x1b[1;33mSuggestion:\x1b[0m {}", error, suggestion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_restore_error_mentions_path() {
        let msg = checkpoint_restore_error("storage/000010/trainer.json");
        assert!(msg.contains("storage/000010/trainer.json"));
        assert!(msg.contains("Batch size changed"));
    }

    #[test]
    fn test_user_context_with_suggestion() {
        let result: Result<()> = Err(anyhow::anyhow!("boom"));
        let err = result
            .user_context_with_suggestion("Could not save", "check disk space")
            .unwrap_err();
        let rendered = format!("{:#}", err);
        assert!(rendered.contains("Could not save"));
        assert!(rendered.contains("check disk space"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn test_snapshot_error_display() {
        let err = SnapshotError::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "snapshot schema version 9 is newer than supported version 1"
        );
    }
}
