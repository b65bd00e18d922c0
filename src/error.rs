//! Error taxonomy shared by the bundle runner and the template renderer.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, RenderError>;

/// Everything that can go wrong between loading a bundle and flushing HTML.
///
/// Format and compilation failures name the offending file or field. None of
/// these are fatal to the host process: they are returned from render calls or
/// yielded as the last item of a render stream.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The bundle is missing fields, has the wrong shape, or could not be read.
    #[error("invalid server-rendering bundle: {message}")]
    InvalidBundleFormat { message: String },

    /// A virtual module's source could not be compiled.
    #[error("failed to compile '{file}': {message}")]
    Compilation { file: String, message: String },

    /// Sandboxed code threw while evaluating or rendering.
    #[error("{message}")]
    Execution {
        message: String,
        /// JS stack, rewritten to original sources once source maps resolve.
        stack: Option<String>,
    },

    /// A shared-context strategy needs the entry to export a function.
    #[error("bundle export should be a function when the execution context is reused, got {found}")]
    InvalidEntryExport { found: String },

    /// The shell template does not contain the content placeholder.
    #[error("content placeholder '{placeholder}' not found in template")]
    TemplatePlaceholderMissing { placeholder: String },

    /// A template-only operation was requested without a template.
    #[error("{operation} cannot be called without a template")]
    MissingTemplate { operation: &'static str },

    /// Render context data failed validation before entering the sandbox.
    #[error("invalid render context: {0}")]
    InvalidContext(String),

    /// The component renderer could not turn the component into markup.
    #[error("component render failed: {0}")]
    Render(String),

    /// The build produced more than one JS asset for the server entry.
    #[error("server-side bundle should have one single entry file, found {}", assets.join(", "))]
    MultipleServerEntries { assets: Vec<String> },

    /// The build produced no JS asset for the server entry.
    #[error("entry \"{entry}\" not found, did you specify the correct entry option?")]
    MissingServerEntry { entry: String },

    /// Reading a client manifest from disk failed.
    #[error("failed to read '{path}': {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// The JS host itself failed (isolate setup, event loop, timeouts).
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl RenderError {
    pub(crate) fn invalid_bundle(message: impl Into<String>) -> Self {
        Self::InvalidBundleFormat {
            message: message.into(),
        }
    }

    /// The JS stack attached to an execution error, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Execution { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RenderError {
    fn from(error: anyhow::Error) -> Self {
        Self::Runtime(error.to_string())
    }
}
