//! Provisioning loop.
//!
//! Each notification goes through `resolve -> materialize -> reconcile`.
//! A failing event is logged and dropped; the loop never stops because of it
//! and never retries it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::channel::{Delivery, EventSource, NotificationEvent};
use crate::keydir::KeyDir;
use crate::reconcile::Reconciler;
use crate::store::RecordStore;

/// Pipeline stage an event failed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Materialize,
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::Materialize => "materialize",
            Stage::Reconcile => "reconcile",
        })
    }
}

/// Terminal state of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Key written and gitolite reconciled.
    Provisioned { username: String },
    /// Key written, but reconciliation failed.
    ReconcileFailed { username: String },
    /// Dropped before reconciliation.
    Dropped(Stage),
}

/// Consumes notifications, one at a time.
pub struct Consumer<S> {
    source: S,
    store: Arc<dyn RecordStore>,
    keydir: KeyDir,
    reconciler: Arc<dyn Reconciler>,
    wait: Duration,
}

impl<S: EventSource> Consumer<S> {
    /// Create a new [`Consumer`].
    pub fn new(
        source: S,
        store: Arc<dyn RecordStore>,
        keydir: KeyDir,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            source,
            store,
            keydir,
            reconciler,
            wait: Duration::from_secs(1),
        }
    }

    /// Update the receive wait, also used as backoff after channel errors.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Consume notifications forever.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Consume notifications until `shutdown` resolves.
    ///
    /// An event being handled is always completed first.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                delivery = self.source.next_delivery(self.wait) => match delivery {
                    Ok(Some(Delivery::Event(event))) => {
                        self.handle(&event).await;
                    },
                    Ok(Some(Delivery::Control)) => {
                        tracing::trace!("control message ignored");
                    },
                    Ok(None) => {},
                    Err(err) => {
                        tracing::warn!(error = %err, "notification channel failed");
                        tokio::time::sleep(self.wait).await;
                    },
                },
            }
        }

        tracing::info!("consumer stopped");
    }

    /// Process a single notification.
    pub async fn handle(&self, event: &NotificationEvent) -> Outcome {
        let span = tracing::info_span!("event", id = %event.lossy_id());
        self.provision(event).instrument(span).await
    }

    async fn provision(&self, event: &NotificationEvent) -> Outcome {
        tracing::debug!("notification received");

        let record = match self.store.resolve(event.id()).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    stage = %Stage::Resolve,
                    unavailable = err.is_unavailable(),
                    error = %err,
                    "event dropped"
                );
                return Outcome::Dropped(Stage::Resolve);
            },
        };
        let username = record.username().to_owned();

        let path = match self.keydir.materialize_async(&username, record.ssh_key()).await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(
                    stage = %Stage::Materialize,
                    %username,
                    error = %err,
                    "event dropped"
                );
                return Outcome::Dropped(Stage::Materialize);
            },
        };
        tracing::info!(%username, path = %path.display(), "public key written");

        match self.reconciler.reconcile().await {
            Ok(()) => {
                tracing::info!(%username, "user provisioned");
                Outcome::Provisioned { username }
            },
            Err(err) => {
                tracing::error!(
                    stage = %Stage::Reconcile,
                    %username,
                    error = %err,
                    "error setting up key"
                );
                Outcome::ReconcileFailed { username }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::channel::{ChannelError, ScriptedSource};
    use crate::reconcile::CountingReconciler;
    use crate::store::MemoryStore;

    const ALICE_KEY: &str = "ssh-ed25519 AAAA... alice";

    fn event(id: &str) -> NotificationEvent {
        NotificationEvent::new(id.as_bytes())
    }

    fn consumer(
        store: MemoryStore,
        keydir: &Path,
        reconciler: &Arc<CountingReconciler>,
        source: ScriptedSource,
    ) -> Consumer<ScriptedSource> {
        Consumer::new(
            source,
            Arc::new(store),
            KeyDir::new(keydir),
            Arc::clone(reconciler) as Arc<dyn Reconciler>,
        )
        .wait(Duration::from_millis(10))
    }

    async fn run(consumer: Consumer<ScriptedSource>, exhausted: Arc<tokio::sync::Notify>) {
        let shutdown = async move { exhausted.notified().await };
        tokio::time::timeout(Duration::from_secs(10), consumer.run_until(shutdown))
            .await
            .expect("consumer did not stop");
    }

    #[tokio::test]
    async fn test_provision() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default().watching(dir.path()));
        let consumer = consumer(
            MemoryStore::default().with_user("user:42", "alice", ALICE_KEY),
            dir.path(),
            &reconciler,
            ScriptedSource::events(&[]),
        );

        let outcome = consumer.handle(&event("user:42")).await;

        assert_eq!(outcome, Outcome::Provisioned { username: "alice".into() });
        assert_eq!(
            std::fs::read_to_string(dir.path().join("alice.pub")).unwrap(),
            ALICE_KEY
        );
        assert_eq!(reconciler.calls(), 1);
        // reconciliation ran after the key was in place.
        assert_eq!(reconciler.seen(), vec![vec!["alice.pub".to_owned()]]);
    }

    #[tokio::test]
    async fn test_unknown_record() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let consumer = consumer(
            MemoryStore::default(),
            dir.path(),
            &reconciler,
            ScriptedSource::events(&[]),
        );

        assert_eq!(
            consumer.handle(&event("user:99")).await,
            Outcome::Dropped(Stage::Resolve)
        );
        assert_eq!(consumer.handle(&event("")).await, Outcome::Dropped(Stage::Resolve));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(reconciler.calls(), 0);
    }

    #[tokio::test]
    async fn test_binary_id() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let consumer = consumer(
            MemoryStore::default().with_user(b"user:\xff42", "alice", ALICE_KEY),
            dir.path(),
            &reconciler,
            ScriptedSource::events(&[]),
        );

        assert_eq!(
            consumer.handle(&NotificationEvent::new(b"user:\xff42")).await,
            Outcome::Provisioned { username: "alice".into() }
        );
        // looked up byte for byte, not through its printable form.
        assert_eq!(
            consumer.handle(&event("user:\u{fffd}42")).await,
            Outcome::Dropped(Stage::Resolve)
        );
        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test]
    async fn test_store_outage() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let consumer = consumer(
            MemoryStore::default().with_outage("user:42"),
            dir.path(),
            &reconciler,
            ScriptedSource::events(&[]),
        );

        assert_eq!(
            consumer.handle(&event("user:42")).await,
            Outcome::Dropped(Stage::Resolve)
        );
        assert_eq!(reconciler.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_username() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("keydir");
        std::fs::create_dir(&dir).unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let consumer = consumer(
            MemoryStore::default().with_user("user:1", "../../etc", ALICE_KEY),
            &dir,
            &reconciler,
            ScriptedSource::events(&[]),
        );

        assert_eq!(
            consumer.handle(&event("user:1")).await,
            Outcome::Dropped(Stage::Materialize)
        );
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
        assert_eq!(reconciler.calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_failure_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::failing());
        let consumer = consumer(
            MemoryStore::default().with_user("user:42", "alice", ALICE_KEY),
            dir.path(),
            &reconciler,
            ScriptedSource::events(&[]),
        );

        assert_eq!(
            consumer.handle(&event("user:42")).await,
            Outcome::ReconcileFailed { username: "alice".into() }
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("alice.pub")).unwrap(),
            ALICE_KEY
        );
        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let store = MemoryStore::default()
            .with_user("user:1", "alice", "ssh-ed25519 AAAA alice")
            .with_fields("user:2", &[("username", "mallory")])
            .with_user("user:3", "bob", "ssh-ed25519 BBBB bob")
            .with_user("user:4", "carol", "ssh-ed25519 CCCC carol");
        let source = ScriptedSource::new([
            Ok(Some(Delivery::Event(event("user:1")))),
            Ok(Some(Delivery::Control)),
            Ok(Some(Delivery::Event(event("user:2")))),
            Ok(None),
            Err(ChannelError::Closed),
            Ok(Some(Delivery::Event(event("user:3")))),
            Ok(Some(Delivery::Event(event("user:4")))),
        ]);
        let exhausted = source.exhausted();

        run(consumer(store, dir.path(), &reconciler, source), exhausted).await;

        for (username, key) in [
            ("alice", "ssh-ed25519 AAAA alice"),
            ("bob", "ssh-ed25519 BBBB bob"),
            ("carol", "ssh-ed25519 CCCC carol"),
        ] {
            assert_eq!(
                std::fs::read_to_string(dir.path().join(format!("{username}.pub"))).unwrap(),
                key
            );
        }
        assert!(!dir.path().join("mallory.pub").exists());
        assert_eq!(reconciler.calls(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_events() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(CountingReconciler::default());
        let source = ScriptedSource::events(&["user:42", "user:42"]);
        let exhausted = source.exhausted();

        run(
            consumer(
                MemoryStore::default().with_user("user:42", "alice", ALICE_KEY),
                dir.path(),
                &reconciler,
                source,
            ),
            exhausted,
        )
        .await;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("alice.pub")).unwrap(),
            ALICE_KEY
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(reconciler.calls(), 2);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Resolve.to_string(), "resolve");
        assert_eq!(Stage::Materialize.to_string(), "materialize");
        assert_eq!(Stage::Reconcile.to_string(), "reconcile");
    }
}
