//! Error type for the server crate: wraps `speql::SpeqlError` with the
//! transport/IO failures that only make sense once there's a network.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] speql::SpeqlError),

    #[error("warehouse transport error: {0}")]
    Warehouse(String),

    #[error("llm transport error: {0}")]
    Llm(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
