#![forbid(unsafe_code)]

//! Error taxonomy shared by the collaborator wrapper and the HTTP layer.

use std::path::PathBuf;

/// Result alias used across the library modules.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Everything that can go wrong while serving a single request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A required query parameter was missing or empty.
    #[error("missing required parameter(s): {}", fields.join(", "))]
    Validation { fields: Vec<&'static str> },

    /// The tool ran but exited unsuccessfully or printed nothing.
    #[error("{program} failed with code {code}: {stderr}")]
    Execution {
        program: String,
        code: String,
        stderr: String,
    },

    /// The tool printed something that is not the metadata we expect.
    #[error("Failed to parse video information: {0}")]
    Parse(#[from] serde_json::Error),

    /// The executable could not be launched at all.
    #[error("failed to start {}: {source}", program.display())]
    ProcessStart {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or reading from a running process failed.
    #[error("I/O error while talking to the extractor: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Short label used in log lines so execution and parse failures stay
    /// distinguishable even though clients see the same response shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Execution { .. } => "execution",
            Self::Parse(_) => "parse",
            Self::ProcessStart { .. } => "process_start",
            Self::Io(_) => "io",
        }
    }

    /// Returns the missing fields for validation failures.
    pub fn missing_fields(&self) -> Option<&[&'static str]> {
        match self {
            Self::Validation { fields } => Some(fields),
            _ => None,
        }
    }
}

/// Collects the names of every parameter that is absent or blank.
///
/// Returns `Ok(())` when all of them carry a value so handlers can bail with
/// `?` before touching the extractor.
pub fn require_params(params: &[(&'static str, Option<&str>)]) -> Result<()> {
    let fields: Vec<&'static str> = params
        .iter()
        .filter(|(_, value)| value.is_none_or(str::is_empty))
        .map(|(name, _)| *name)
        .collect();
    if fields.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::Validation { fields })
    }
}
