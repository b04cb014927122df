use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("shape contract violated in {context}: {message}")]
    ShapeContractViolation {
        context: &'static str,
        message: String,
    },
    #[error("export failed during {context}: {message}")]
    ExportFailure {
        context: &'static str,
        message: String,
    },
    #[error("session load failed during {context}: {message}")]
    SessionLoadError {
        context: &'static str,
        message: String,
    },
    #[error("inference run failed during {context}: {message}")]
    InferenceRunError {
        context: &'static str,
        message: String,
    },
    #[error("boundary sets disagree structurally: {left} vs {right} boundaries")]
    StructuralMismatch { left: usize, right: usize },
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("safetensors error while {context}: {message}")]
    Safetensors {
        context: &'static str,
        message: String,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

pub type Result<T> = std::result::Result<T, ConversionError>;

impl ConversionError {
    pub(crate) fn shape_contract(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ShapeContractViolation {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn export(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ExportFailure {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn session_load(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::SessionLoadError {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn inference(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::InferenceRunError {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn safetensors(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Safetensors {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Short stable label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShapeContractViolation { .. } => "shape_contract_violation",
            Self::ExportFailure { .. } => "export_failure",
            Self::SessionLoadError { .. } => "session_load_error",
            Self::InferenceRunError { .. } => "inference_run_error",
            Self::StructuralMismatch { .. } => "structural_mismatch",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
            Self::Safetensors { .. } => "safetensors",
            Self::InvalidInput { .. } => "invalid_input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context_and_message() {
        let err = ConversionError::export("trace", "dynamic axis read");
        assert_eq!(
            err.to_string(),
            "export failed during trace: dynamic axis read"
        );
        assert_eq!(err.kind(), "export_failure");
    }

    #[test]
    fn structural_mismatch_reports_both_lengths() {
        let err = ConversionError::StructuralMismatch { left: 2, right: 3 };
        assert!(err.to_string().contains("2 vs 3"));
    }
}
