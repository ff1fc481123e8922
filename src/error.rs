use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalystError {
    ConfigurationError(String),
    AnalyzeError(String),
    ExecutorError(String),
    ClientError(String),
    StorageError(String),
    ProcessorError(String),
    InvalidState(String),
}

impl fmt::Display for AnalystError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalystError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
            AnalystError::AnalyzeError(msg) => write!(f, "Analyze error: {msg}"),
            AnalystError::ExecutorError(msg) => write!(f, "Executor error: {msg}"),
            AnalystError::ClientError(msg) => write!(f, "Coordinator client error: {msg}"),
            AnalystError::StorageError(msg) => write!(f, "Storage error: {msg}"),
            AnalystError::ProcessorError(msg) => write!(f, "Processor error: {msg}"),
            AnalystError::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

impl std::error::Error for AnalystError {}

impl From<crate::analyzer::AnalyzeError> for AnalystError {
    fn from(e: crate::analyzer::AnalyzeError) -> Self {
        AnalystError::AnalyzeError(e.to_string())
    }
}

impl From<crate::executor::ExecutorError> for AnalystError {
    fn from(e: crate::executor::ExecutorError) -> Self {
        AnalystError::ExecutorError(e.to_string())
    }
}

impl From<crate::client::ClientError> for AnalystError {
    fn from(e: crate::client::ClientError) -> Self {
        AnalystError::ClientError(e.to_string())
    }
}

impl From<crate::storage::StorageError> for AnalystError {
    fn from(e: crate::storage::StorageError) -> Self {
        AnalystError::StorageError(e.to_string())
    }
}

impl From<crate::processor::ProcessorError> for AnalystError {
    fn from(e: crate::processor::ProcessorError) -> Self {
        AnalystError::ProcessorError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnalystError>;
