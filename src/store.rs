//! User record lookups.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use tokio::time::timeout;

use crate::user::{RecordError, UserRecord};

/// Errors returned while resolving a record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record for `{id}`")]
    NotFound { id: String },

    #[error("record `{id}` is malformed: {source}")]
    Malformed {
        id: String,
        #[source]
        source: RecordError,
    },

    #[error("redis unavailable: {0}")]
    Unavailable(#[from] RedisError),

    #[error("redis did not answer within {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether the failure comes from the link rather than the record.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    fn lookup(id: &[u8], err: RedisError) -> Self {
        // the key exists but holds a string, list...
        if err.kind() == ErrorKind::TypeError || err.code() == Some("WRONGTYPE") {
            Self::Malformed {
                id: render(id),
                source: RecordError::NotAHash,
            }
        } else {
            Self::Unavailable(err)
        }
    }
}

/// Printable form of a record id, which may not be UTF-8.
fn render(id: &[u8]) -> String {
    String::from_utf8_lossy(id).into_owned()
}

/// Port for user record lookups.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the [`UserRecord`] referenced by `id`.
    ///
    /// `id` is the key exactly as published, byte for byte.
    async fn resolve(&self, id: &[u8]) -> Result<UserRecord, StoreError>;
}

/// Redis-backed record store. Records are hashes keyed by id.
///
/// The [`ConnectionManager`] reconnects in the background once the link
/// drops; lookups made in the meantime fail as unavailable.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to redis and check the link with a `PING`.
    pub async fn connect(
        client: &Client,
        limit: Duration,
    ) -> Result<Self, StoreError> {
        let mut conn = timeout(limit, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(limit))??;

        let _: String = timeout(limit, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(limit))??;

        tracing::info!(addr = ?client.get_connection_info().addr, "redis connected");

        Ok(Self {
            conn,
            timeout: limit,
        })
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn resolve(&self, id: &[u8]) -> Result<UserRecord, StoreError> {
        let mut conn = self.conn.clone();

        let fields: HashMap<String, Vec<u8>> =
            timeout(self.timeout, conn.hgetall(id))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))?
                .map_err(|err| StoreError::lookup(id, err))?;

        tracing::trace!(id = %render(id), fields = fields.len(), "record fetched");

        decode(id, &fields)
    }
}

fn decode(
    id: &[u8],
    fields: &HashMap<String, Vec<u8>>,
) -> Result<UserRecord, StoreError> {
    // HGETALL answers an empty hash for unknown keys.
    if fields.is_empty() {
        return Err(StoreError::NotFound { id: render(id) });
    }

    UserRecord::from_fields(fields).map_err(|source| StoreError::Malformed {
        id: render(id),
        source,
    })
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    records: HashMap<Vec<u8>, HashMap<String, Vec<u8>>>,
    unavailable: std::collections::HashSet<Vec<u8>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_user(
        mut self,
        id: impl AsRef<[u8]>,
        username: &str,
        ssh_key: &str,
    ) -> Self {
        let fields = HashMap::from([
            ("username".to_owned(), username.as_bytes().to_vec()),
            ("ssh_key".to_owned(), ssh_key.as_bytes().to_vec()),
        ]);
        self.records.insert(id.as_ref().to_vec(), fields);
        self
    }

    pub fn with_fields(mut self, id: impl AsRef<[u8]>, fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.records.insert(id.as_ref().to_vec(), fields);
        self
    }

    /// Make lookups of `id` fail as if redis went away.
    pub fn with_outage(mut self, id: impl AsRef<[u8]>) -> Self {
        self.unavailable.insert(id.as_ref().to_vec());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl RecordStore for MemoryStore {
    async fn resolve(&self, id: &[u8]) -> Result<UserRecord, StoreError> {
        if self.unavailable.contains(id) {
            return Err(StoreError::Unavailable(RedisError::from(
                std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            )));
        }

        let empty = HashMap::new();
        decode(id, self.records.get(id).unwrap_or(&empty))
    }
}
