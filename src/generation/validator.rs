//! Content acceptance checks.
//!
//! A backend that exits cleanly may still have produced nothing. The
//! validator is the single place that decides whether output counts as
//! content: it must be present, non-whitespace, and at least
//! `min_length` characters after trimming. Anything shorter is treated the
//! same as no output at all, regardless of what the backend reported.

use std::fmt;

/// Minimum trimmed length, in characters, for accepted content.
pub const DEFAULT_MIN_CONTENT_LENGTH: usize = 200;

/// Why output was judged to be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyReason {
    /// The backend returned no content field at all.
    Missing,
    /// Content was present but only whitespace.
    Whitespace,
    /// Trimmed content was shorter than the threshold.
    BelowMinimum { length: usize, minimum: usize },
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::Missing => write!(f, "no content returned"),
            EmptyReason::Whitespace => write!(f, "content was whitespace only"),
            EmptyReason::BelowMinimum { length, minimum } => {
                write!(f, "content length {} below minimum {}", length, minimum)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentValidator {
    min_length: usize,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONTENT_LENGTH)
    }
}

impl ContentValidator {
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length: min_length.max(1),
        }
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Returns the trimmed content on success.
    pub fn validate<'a>(&self, content: Option<&'a str>) -> Result<&'a str, EmptyReason> {
        let content = content.ok_or(EmptyReason::Missing)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(EmptyReason::Whitespace);
        }
        let length = trimmed.chars().count();
        if length < self.min_length {
            return Err(EmptyReason::BelowMinimum {
                length,
                minimum: self.min_length,
            });
        }
        Ok(trimmed)
    }

    pub fn is_acceptable(&self, content: &str) -> bool {
        self.validate(Some(content)).is_ok()
    }
}
