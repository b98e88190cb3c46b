use std::path::PathBuf;

pub type ReelResult<T> = Result<T, ReelError>;

/// Every failure the compiler can surface. Variants carry enough context to
/// reproduce the failure from the error text alone.
#[derive(thiserror::Error, Debug)]
pub enum ReelError {
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("fragment '{fragment_id}' references unknown asset/container/app '{target}'")]
    UnknownReference { fragment_id: String, target: String },

    #[error("asset file not found: {}", .path.display())]
    AssetMissing { path: PathBuf },

    #[error("probing '{}' failed: {message}", .path.display())]
    AssetProbeFailed { path: PathBuf, message: String },

    #[error("expression parse error in '{text}': {message}")]
    ExpressionParse { text: String, message: String },

    #[error("expression eval error in '{text}': {message}")]
    ExpressionEval { text: String, message: String },

    #[error("timing expressions never resolved for fragments: {}", .fragment_ids.join(", "))]
    UnresolvableExpression { fragment_ids: Vec<String> },

    #[error(
        "fragment '{fragment_id}' requests {requested_ms}ms but only {available_ms}ms remain after trim"
    )]
    DurationOverflow {
        fragment_id: String,
        requested_ms: f64,
        available_ms: f64,
    },

    #[error("invalid '{fragment_id}': {message}")]
    FragmentInvalid { fragment_id: String, message: String },

    #[error("invalid inputs for filter '{filter}': {details}")]
    InvalidFilterInputs { filter: String, details: String },

    #[error("app '{app_id}' did not signal render completion within the deadline")]
    AppRenderTimeout { app_id: String },

    #[error("rasterizing container '{container_id}' failed: {message}")]
    ContainerRenderFailed {
        container_id: String,
        message: String,
    },

    #[error("encoder binary not found on PATH")]
    EncoderNotFound,

    #[error("encoder exited with code {exit_code}:\n{tail}")]
    EncoderFailed { exit_code: i32, tail: String },

    #[error("render cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReelError {
    pub fn parse(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            col,
            message: message.into(),
        }
    }

    pub fn expression_parse(text: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExpressionParse {
            text: text.into(),
            message: message.into(),
        }
    }

    pub fn expression_eval(text: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExpressionEval {
            text: text.into(),
            message: message.into(),
        }
    }

    pub fn fragment_invalid(fragment_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FragmentInvalid {
            fragment_id: fragment_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_filter_inputs(filter: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidFilterInputs {
            filter: filter.into(),
            details: details.into(),
        }
    }

    /// Process exit code for the CLI: 1 for project/user errors, 2 for
    /// external-tool failures, 3 for cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. }
            | Self::UnknownReference { .. }
            | Self::AssetMissing { .. }
            | Self::ExpressionParse { .. }
            | Self::ExpressionEval { .. }
            | Self::UnresolvableExpression { .. }
            | Self::DurationOverflow { .. }
            | Self::FragmentInvalid { .. }
            | Self::InvalidFilterInputs { .. } => 1,
            Self::AssetProbeFailed { .. }
            | Self::AppRenderTimeout { .. }
            | Self::ContainerRenderFailed { .. }
            | Self::EncoderNotFound
            | Self::EncoderFailed { .. }
            | Self::Other(_) => 2,
            Self::Cancelled => 3,
        }
    }
}
