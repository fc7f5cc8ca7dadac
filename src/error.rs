use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("storage error: {0}")]
    Storage(String),
}
