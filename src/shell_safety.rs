//! Shell Safety — Command Injection Prevention
//!
//! Provides sanitization and validation utilities for the identifiers that
//! flow from a task graph or CLI argument into a launcher subprocess
//! invocation: feature names, branch names, worker env values.
//!
//! # Threat Model
//!
//! - **Container exec:** a feature or branch value reaches `docker run`/`exec`
//!   as a literal argument or `-e KEY=value` pair. `Command::new(cmd).args(args)`
//!   does NOT invoke a shell, so metacharacters there are inert, but a value
//!   containing them is still rejected as defense-in-depth before the
//!   subprocess is built (the caller may opt out, §4.3).
//! - **Container naming:** the container engine restricts names to a narrow
//!   character set regardless of injection risk; `sanitize_identifier`
//!   enforces that set directly rather than rejecting.
//!
//! # Usage
//!
//! ```rust,ignore
//! use zerg_orchestrator::shell_safety::{sanitize_identifier, validate_arg};
//!
//! let container_name = format!("zerg-{}-worker-{id}", sanitize_identifier(feature));
//! validate_arg(branch)?; // defense-in-depth before it reaches `docker run -e BRANCH=...`
//! ```

/// Shell metacharacters that can cause command injection when interpreted
/// by a shell (bash/sh/zsh).
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r', '!', '#', '~', '*', '?',
    '[', ']', '\\', '"', '\'',
];

/// Subset of metacharacters that indicate chaining/injection intent
/// (vs. globbing characters that might appear in legitimate args).
const INJECTION_CHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

/// Validation error for argument checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValidationError {
    /// The problematic character found.
    pub character: char,
    /// Position in the input string.
    pub position: usize,
    /// The original input (truncated to 100 chars).
    pub input_preview: String,
}

impl std::fmt::Display for ArgValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dangerous character '{}' at position {} in: {}",
            self.character.escape_default(),
            self.position,
            self.input_preview
        )
    }
}

impl std::error::Error for ArgValidationError {}

/// Validate that an argument contains no injection-class metacharacters.
///
/// Use this for defense-in-depth on arguments passed to `Command::new().arg()`,
/// which doesn't invoke a shell but where we still want to catch suspicious input.
///
/// Returns Ok(()) if clean, Err with details if a dangerous character is found.
pub fn validate_arg(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if INJECTION_CHARACTERS.contains(&ch) {
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview: if arg.len() > 100 {
                    format!("{}...", &arg[..100])
                } else {
                    arg.to_string()
                },
            });
        }
    }
    Ok(())
}

/// Validate that an argument contains no shell metacharacters at all.
///
/// Stricter than [`validate_arg`] — also rejects globbing characters, quotes,
/// and other characters that have special meaning in shells.
pub fn validate_strict(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if SHELL_METACHARACTERS.contains(&ch) {
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview: if arg.len() > 100 {
                    format!("{}...", &arg[..100])
                } else {
                    arg.to_string()
                },
            });
        }
    }
    Ok(())
}

/// Sanitize a string for use as a filename or identifier component.
///
/// Replaces any character that is not alphanumeric, `-`, `_`, or `.` with `_`.
/// Also prevents path traversal by replacing `/` and `\`.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
