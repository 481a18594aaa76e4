use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("envelope decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
