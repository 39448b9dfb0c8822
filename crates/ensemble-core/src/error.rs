use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Numerical error in fold {fold}{}: {detail}", member_suffix(.member))]
    Numerical {
        fold: usize,
        member: Option<usize>,
        detail: String,
    },

    #[error("Checkpoint error for fold {fold}, member {member}: {detail}")]
    Checkpoint {
        fold: usize,
        member: usize,
        detail: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn member_suffix(member: &Option<usize>) -> String {
    match member {
        Some(id) => format!(", member {id}"),
        None => String::new(),
    }
}

impl EnsembleError {
    pub fn numerical(fold: usize, member: Option<usize>, detail: impl Into<String>) -> Self {
        EnsembleError::Numerical {
            fold,
            member,
            detail: detail.into(),
        }
    }

    pub fn checkpoint(key: crate::CheckpointKey, detail: impl Into<String>) -> Self {
        EnsembleError::Checkpoint {
            fold: key.fold,
            member: key.member,
            detail: detail.into(),
        }
    }

    pub fn in_fold(self, fold: usize) -> Self {
        match self {
            EnsembleError::Numerical { member, detail, .. } => EnsembleError::Numerical {
                fold,
                member,
                detail,
            },
            other => other,
        }
    }

    /// Attach fold/member context to a numerical error raised without it.
    pub fn in_member(self, fold: usize, member: usize) -> Self {
        match self {
            EnsembleError::Numerical { detail, .. } => EnsembleError::Numerical {
                fold,
                member: Some(member),
                detail,
            },
            other => other,
        }
    }
}

pub type EnsembleResult<T> = Result<T, EnsembleError>;
