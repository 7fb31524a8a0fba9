use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxndError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TxndError {
    /// Short error code string, used as the prefix of CLI error lines.
    pub fn code(&self) -> &'static str {
        match self {
            TxndError::Config(_) => "CONFIG_ERROR",
            TxndError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TxndError>;
