//! Error types for traffic routers.

use thiserror::Error;

pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown traffic router {0:?}")]
    UnknownRouter(String),

    #[error("invalid router config: {0}")]
    Config(String),

    #[error("router rejected change: {0}")]
    Rejected(String),

    #[error("router unavailable: {0}")]
    Unavailable(String),
}
