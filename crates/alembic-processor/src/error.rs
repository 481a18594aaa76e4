use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("topic provisioning error: {0}")]
    TopicProvisioning(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("projection error: {0}")]
    Dsl(#[from] alembic_dsl::DslError),

    #[error("configuration error: {0}")]
    Config(#[from] alembic_core::Error),

    #[error("stage failed to start: {0}")]
    StartAborted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ProcessorError {
    fn from(err: rusqlite::Error) -> Self {
        ProcessorError::State(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
