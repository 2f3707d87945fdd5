//! Error types for document loading and test execution.
//!
//! Everything raised while loading a document is a configuration error and
//! aborts the whole document. At run time only setup, spawn and cleanup
//! failures surface as [`Error`]; assertion mismatches are reported as checks.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while rendering `${name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A placeholder names a variable that is not in scope.
    #[error("undefined variable '{name}'")]
    Missing { name: String },
    /// A `$` that does not start a valid placeholder.
    #[error("invalid placeholder at offset {offset} in {text:?}")]
    InvalidPlaceholder { text: String, offset: usize },
}

/// Error type for loading documents and running tests.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to read a file.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is malformed.
    #[error("invalid document: {0}")]
    Parse(String),

    /// A variable descriptor is malformed or its loader failed.
    #[error("invalid variable '{name}': {reason}")]
    InvalidVariable { name: String, reason: String },

    /// A variable descriptor has a missing or unregistered `type`.
    #[error("invalid type for variable '{name}': {reason}")]
    InvalidVariableType { name: String, reason: String },

    /// Variables left unresolved after a resolution pass made no progress.
    #[error("circular or unsatisfiable variable dependencies: {}", .0.join(", "))]
    VariableLoop(Vec<String>),

    /// An assertion with an unregistered `type`.
    #[error("unsupported assertion type '{0}'")]
    InvalidAssertionClass(String),

    /// A pre-run step with an unknown `type` or `command`.
    #[error("unsupported pre-run step: {0}")]
    InvalidParameterClass(String),

    /// A registration names an attribute the step does not produce.
    #[error("invalid value name '{attribute}' (must be one of {})", allowed.join("|"))]
    InvalidRegistrationVariable {
        attribute: String,
        allowed: Vec<&'static str>,
    },

    /// A case refers to a pre-run definition that does not exist.
    #[error("unknown pre-run definition '{0}'")]
    UnknownDefinition(String),

    /// A template file referenced by a `write_file` step does not exist.
    #[error("template file {} not found", .0.display())]
    MissingTemplate(PathBuf),

    /// Placeholder substitution failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A run tried to bind a variable that already holds another value.
    #[error("variable '{name}' is already bound to {existing:?}, refusing {value:?}")]
    VariableRedefined {
        name: String,
        existing: String,
        value: String,
    },

    /// The process could not be spawned or waited on.
    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not exit in time and was killed.
    #[error("command {command:?} timed out after {}s", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    /// A setup action ran but reported failure.
    #[error("{step} failed: {message}")]
    StepFailed { step: String, message: String },

    /// Several independent failures, e.g. from a best-effort cleanup.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, [`Error::Multiple`] otherwise.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
