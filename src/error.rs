//! Configuration errors raised while building suites, steps and
//! templates.
//!
//! These are fatal to the unit being constructed. Runtime
//! failures inside steps travel as `anyhow::Error` instead, and
//! assertion failures are never errors at all.

use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unknown {family} type '{discriminator}'")]
    UnknownType {
        family: &'static str,
        discriminator: String,
    },

    #[error(
        "duplicate {family} type '{discriminator}' \
         (registered by {existing}, rejected {incoming})"
    )]
    DuplicateType {
        family: &'static str,
        discriminator: String,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("invalid {family} '{discriminator}': {message}")]
    InvalidDefinition {
        family: &'static str,
        discriminator: String,
        message: String,
    },

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("template '{template}' requires parameter '{param}'")]
    MissingParameter { template: String, param: String },

    #[error(
        "parameter '{param}' of template '{template}' expects \
         {expected}, got {actual}"
    )]
    ParameterType {
        template: String,
        param: String,
        expected: String,
        actual: String,
    },

    #[error("invalid variable path '{0}'")]
    InvalidPath(String),

    #[error("variable root '{0}' is read-only")]
    ReadOnlyRoot(String),

    #[error("assertion mask flag is already set")]
    MaskAlreadySet,
}
