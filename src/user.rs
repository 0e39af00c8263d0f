//! User records published by the signup service.

use std::collections::HashMap;

/// Hash field holding the gitolite username.
pub const USERNAME_FIELD: &str = "username";
/// Hash field holding the OpenSSH public key.
pub const SSH_KEY_FIELD: &str = "ssh_key";

/// Reason a stored record cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("missing `{0}` field")]
    Missing(&'static str),
    #[error("empty `{0}` field")]
    Empty(&'static str),
    #[error("`{0}` field is not valid UTF-8")]
    Encoding(&'static str),
    #[error("key does not hold a hash")]
    NotAHash,
}

/// User record, as stored in redis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    username: String,
    ssh_key: String,
}

impl UserRecord {
    /// Create a new [`UserRecord`].
    pub fn new(
        username: impl Into<String>,
        ssh_key: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let username = username.into();
        let ssh_key = ssh_key.into();

        if username.trim().is_empty() {
            return Err(RecordError::Empty(USERNAME_FIELD));
        }
        if ssh_key.trim().is_empty() {
            return Err(RecordError::Empty(SSH_KEY_FIELD));
        }

        Ok(Self { username, ssh_key })
    }

    /// Decode a record from the raw mapping returned by `HGETALL`.
    pub fn from_fields(
        fields: &HashMap<String, Vec<u8>>,
    ) -> Result<Self, RecordError> {
        let field = |name: &'static str| {
            let raw = fields.get(name).ok_or(RecordError::Missing(name))?;
            String::from_utf8(raw.clone()).map_err(|_| RecordError::Encoding(name))
        };

        Self::new(field(USERNAME_FIELD)?, field(SSH_KEY_FIELD)?)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Public key, byte for byte as stored.
    pub fn ssh_key(&self) -> &str {
        &self.ssh_key
    }
}
