use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a trace file: {0}")]
    Format(String),

    #[error("argument {key:?} is not a scalar value")]
    InvalidArgument { key: String },
}
