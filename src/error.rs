//! Error handler for keysignup.
//!
//! Per-event failures stay inside the consumer; this type only reaches the
//! caller while the daemon boots.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid redis configuration: {0}")]
    Config(#[source] redis::RedisError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
