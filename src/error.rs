use thiserror::Error;

/// Outcomes callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached by the backend that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoxError {
    #[error("box not found: {name}")]
    NotFound { name: String },
    #[error("invalid provider: {value}")]
    InvalidProvider { value: String },
    #[error("invalid resource size: {value}")]
    InvalidSize { value: String },
    #[error("invalid template: {reason}")]
    InvalidTemplate { reason: String },
}

impl BoxError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn invalid_template(reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            reason: reason.into(),
        }
    }
}

pub fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<BoxError>(), Some(BoxError::NotFound { .. })))
}

pub fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}
