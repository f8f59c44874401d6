//! Error types for the Lua bridge.

use crate::value::ValueKind;
use thiserror::Error;

/// Errors that can occur while loading, calling or registering script code.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A chunk failed to parse or raised an error while it ran.
    #[error("Failed to load {chunk}: {source}")]
    Load {
        /// Chunk name (file path or `=string`).
        chunk: String,
        #[source]
        source: mlua::Error,
    },

    /// A named global was missing, not callable, or raised a runtime error.
    #[error("Call to '{name}' failed: {source}")]
    Call {
        /// Name of the global that was called.
        name: String,
        #[source]
        source: mlua::Error,
    },

    /// A strict accessor was used on a value of the wrong kind.
    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },

    /// A number cannot be represented by the requested integer type.
    #[error("Number {value} does not fit in {target}")]
    NumberRange { value: f64, target: &'static str },

    /// A script string holds bytes that are not valid UTF-8.
    #[error("String is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// A host object did not hold the requested Rust type.
    #[error("Host object mismatch: expected {expected}, found {actual}")]
    HostTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A script assigned a field the host type does not expose as writable.
    #[error("{type_name} has no assignable field '{field}'")]
    Field { type_name: String, field: String },

    /// A host object was already borrowed mutably, e.g. by a method that is
    /// still running.
    #[error("{0} is already borrowed")]
    Borrowed(&'static str),

    /// A native function argument failed to convert.
    #[error("Bad argument #{position}: {source}")]
    Argument {
        /// One-based argument position.
        position: usize,
        #[source]
        source: Box<BridgeError>,
    },

    /// A function, module, type or sandbox could not be installed.
    #[error("Registration of '{name}' failed: {reason}")]
    Registration { name: String, reason: String },

    /// A native host function returned an error.
    #[error("Host function error: {0}")]
    Host(String),

    /// Invalid engine configuration.
    #[error("Invalid config: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Any other error reported by the Lua runtime.
    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),
}

impl BridgeError {
    pub(crate) fn registration(name: &str, reason: impl ToString) -> Self {
        BridgeError::Registration {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn at_argument(self, position: usize) -> Self {
        BridgeError::Argument {
            position,
            source: Box::new(self),
        }
    }
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
