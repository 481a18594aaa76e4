use thiserror::Error;

#[derive(Error, Debug)]
pub enum DslError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("script runtime error: {0}")]
    Runtime(String),

    #[error("state serialization error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, DslError>;
