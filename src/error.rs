//! Error types for template compilation.
//!
//! Every failure in a run is fatal: nothing in the engine retries or recovers
//! a partially processed record. Errors are grouped by what went wrong:
//!
//! - **Format errors**: the template itself is malformed (unknown tag, missing
//!   required attribute, unsupported node selected by an edit rule)
//! - **Input-data errors**: record data or a referenced file is unusable
//! - **Infinite-loop errors**: a repeat can never terminate, detected either at
//!   setup or on the first non-advancing iteration
//! - **Encoding errors**: a width, offset or numeral failed to parse or convert.
//!   The failing node never leaves partial bytes behind.
//!
//! Node-related errors carry an optional `context` naming the offending node
//! as an abbreviated path such as `/format/repeat[@name='rows']`.
//!
//! ## Examples
//!
//! ```rust
//! use binform::Error;
//!
//! let err = Error::format("unknown tag 'iteem'", Some("/format/iteem".to_string()));
//! assert!(err.to_string().contains("/format/iteem"));
//! assert!(err.is_format());
//! ```

use std::fmt;
use thiserror::Error;

/// Represents every error a template run can raise.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The template is structurally invalid.
    #[error("Format error: {msg}{}", at(.context))]
    Format { msg: String, context: Option<String> },

    /// Record data or a referenced input is unusable.
    #[error("Input data error: {msg}{}", at(.context))]
    InputData { msg: String, context: Option<String> },

    /// A repeat loop cannot terminate.
    #[error("Infinite loop: {msg}{}", at(.context))]
    InfiniteLoop { msg: String, context: Option<String> },

    /// A value could not be converted to bytes.
    #[error("Encoding error: {msg}{}", at(.context))]
    Encoding { msg: String, context: Option<String> },

    /// A character transformer had no rule for the input at `position`.
    #[error("Transform error at position {position}: {msg} (input: {input:?})")]
    Transform {
        msg: String,
        position: usize,
        input: String,
    },

    /// A record file is malformed.
    #[error("Bad record data at row {row} (line {raw_row}): {msg}\n{record}")]
    BadData {
        msg: String,
        row: usize,
        raw_row: usize,
        record: String,
    },

    /// A template document is not well-formed XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// IO error during reading or writing
    #[error("IO error: {0}")]
    Io(String),

    /// Custom error
    #[error("Error: {0}")]
    Custom(String),
}

fn at(context: &Option<String>) -> String {
    context
        .as_ref()
        .map(|c| format!(" (at {})", c))
        .unwrap_or_default()
}

impl Error {
    /// Creates a format error, optionally naming the offending node.
    pub fn format(msg: impl Into<String>, context: Option<String>) -> Self {
        Error::Format {
            msg: msg.into(),
            context,
        }
    }

    /// Creates an input-data error.
    pub fn input_data(msg: impl Into<String>, context: Option<String>) -> Self {
        Error::InputData {
            msg: msg.into(),
            context,
        }
    }

    /// Creates an infinite-loop error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use binform::Error;
    ///
    /// let err = Error::infinite_loop("repeat has neither max nor fetch", None);
    /// assert!(err.is_infinite_loop());
    /// ```
    pub fn infinite_loop(msg: impl Into<String>, context: Option<String>) -> Self {
        Error::InfiniteLoop {
            msg: msg.into(),
            context,
        }
    }

    /// Creates an encoding error.
    pub fn encoding(msg: impl Into<String>, context: Option<String>) -> Self {
        Error::Encoding {
            msg: msg.into(),
            context,
        }
    }

    /// Creates a transform error for an unmatched character position.
    pub fn transform(msg: impl Into<String>, position: usize, input: &str) -> Self {
        Error::Transform {
            msg: msg.into(),
            position,
            input: input.to_string(),
        }
    }

    /// Creates a malformed-record error.
    pub fn bad_data(msg: impl Into<String>, row: usize, raw_row: usize, record: &str) -> Self {
        Error::BadData {
            msg: msg.into(),
            row,
            raw_row,
            record: record.to_string(),
        }
    }

    /// Creates an XML syntax error.
    pub fn xml<T: fmt::Display>(msg: T) -> Self {
        Error::Xml(msg.to_string())
    }

    /// Creates a custom error with a display message.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates an I/O error for file reading/writing failures.
    pub fn io(msg: &str) -> Self {
        Error::Io(msg.to_string())
    }

    /// Attaches node context to a node-related error that has none yet.
    #[must_use]
    pub fn with_context(self, node: impl FnOnce() -> String) -> Self {
        match self {
            Error::Format { msg, context: None } => Error::format(msg, Some(node())),
            Error::InputData { msg, context: None } => Error::input_data(msg, Some(node())),
            Error::InfiniteLoop { msg, context: None } => Error::infinite_loop(msg, Some(node())),
            Error::Encoding { msg, context: None } => Error::encoding(msg, Some(node())),
            other => other,
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format { .. })
    }

    pub fn is_input_data(&self) -> bool {
        matches!(self, Error::InputData { .. } | Error::BadData { .. })
    }

    pub fn is_infinite_loop(&self) -> bool {
        matches!(self, Error::InfiniteLoop { .. })
    }

    pub fn is_encoding(&self) -> bool {
        matches!(self, Error::Encoding { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
