use crate::points::UnifyError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Non-fatal problem attached to one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub block_id: String,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (block '{}')", self.message, self.block_id)
    }
}

/// Internal invariant violation that aborts the whole compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineError {
    pub message: String,
    pub block_id: Option<String>,
}

impl PipelineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            block_id: None,
        }
    }

    pub fn at(block_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            block_id: Some(block_id.to_string()),
        }
    }
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.block_id {
            Some(id) => write!(f, "{} (block '{}')", self.message, id),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error for PipelineError {}

/// Outcome of one typing rule: a local unification failure or a fatal error.
#[derive(Debug, Clone)]
pub enum InferError {
    Unify(UnifyError),
    Fatal(PipelineError),
}

impl Display for InferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InferError::Unify(err) => write!(f, "{}", err),
            InferError::Fatal(err) => write!(f, "{}", err),
        }
    }
}

impl Error for InferError {}

impl From<UnifyError> for InferError {
    fn from(err: UnifyError) -> Self {
        InferError::Unify(err)
    }
}

impl From<PipelineError> for InferError {
    fn from(err: PipelineError) -> Self {
        InferError::Fatal(err)
    }
}
