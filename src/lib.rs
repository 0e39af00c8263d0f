//! keysignup provisions gitolite SSH keys for newly registered users.
//!
//! The signup service stores each user as a redis hash and publishes its key
//! on a channel. This daemon resolves the hash, writes `<username>.pub` into
//! the gitolite keydir and runs `gitolite setup`.

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod keydir;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod user;

use std::sync::Arc;

use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use crate::channel::RedisChannel;
use crate::config::Configuration;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::keydir::KeyDir;
use crate::reconcile::ReconcileCommand;
use crate::store::RedisStore;

/// Build the redis client described by `config`.
pub fn redis_client(config: &Configuration) -> Result<Client> {
    let info = ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.redis_host.clone(), config.redis_port),
        redis: RedisConnectionInfo {
            password: config.redis_password.clone(),
            ..Default::default()
        },
    };

    Client::open(info).map_err(Error::Config)
}

/// Initialize the consumer.
///
/// The store is pinged first: when it cannot be reached, no subscription is
/// made.
pub async fn initialize(config: &Configuration) -> Result<Consumer<RedisChannel>> {
    let client = redis_client(config)?;

    let store = RedisStore::connect(&client, config.store_timeout()).await?;

    let keydir = KeyDir::new(&config.keydir);
    keydir.check();

    let reconciler =
        ReconcileCommand::gitolite(&config.gitolite_bin, config.reconcile_timeout());

    let source = RedisChannel::subscribe(client, &config.channel).await?;

    Ok(Consumer::new(source, Arc::new(store), keydir, Arc::new(reconciler))
        .wait(config.poll_interval()))
}
