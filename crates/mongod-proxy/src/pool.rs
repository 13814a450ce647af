use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use mongodb::bson::doc;
use mongodb::{Client, Database};

use crate::{Config, Error};

/// Interval between attempts to reach the database server.
const CONNECT_RETRY: Duration = Duration::from_millis(1000);

/// The dialing seam of the pool: readiness gating plus per-database
/// connection establishment.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// Resolves once the server accepts connections. Never fails:
    /// unreachability is retried indefinitely at a fixed interval.
    async fn wait_ready(&self);

    /// Establish the logical connection for `db_name`.
    async fn dial(&self, db_name: &str) -> Result<Self::Conn, Error>;
}

type PendingConn<C> = Shared<BoxFuture<'static, Result<C, Error>>>;

/// One lazily-established, cached connection per logical database name.
/// Entries are never evicted during normal operation.
pub struct ConnectionPool<D: Dial> {
    dial: Arc<D>,
    ready: Arc<tokio::sync::OnceCell<()>>,
    databases: Mutex<HashMap<String, PendingConn<D::Conn>>>,
}

impl<D: Dial> ConnectionPool<D> {
    pub fn new(dial: D) -> Self {
        Self {
            dial: Arc::new(dial),
            ready: Arc::new(tokio::sync::OnceCell::new()),
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `db_name` to its connection, establishing and caching it on
    /// first use. The pending future itself is cached before it is first
    /// polled, so concurrent callers for one name share a single attempt.
    /// Readiness gating is memoized process-wide: the first caller runs the
    /// retry loop, all later callers await the same outcome.
    pub async fn connect(&self, db_name: &str) -> Result<D::Conn, Error> {
        if db_name.is_empty() {
            return Err(Error::InvalidDatabaseName);
        }
        let pending = {
            let mut databases = self.databases.lock().unwrap();
            match databases.get(db_name) {
                Some(pending) => pending.clone(),
                None => {
                    let dial = self.dial.clone();
                    let ready = self.ready.clone();
                    let name = db_name.to_string();
                    let pending = async move {
                        let gate = dial.clone();
                        ready
                            .get_or_init(move || async move { gate.wait_ready().await })
                            .await;
                        dial.dial(&name).await
                    }
                    .boxed()
                    .shared();
                    databases.insert(db_name.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Release all cached connection futures.
    pub fn unload(&self) {
        self.databases.lock().unwrap().clear();
    }
}

/// Production dialer: a dedicated driver client per logical database,
/// gated on the supervised server answering pings.
pub struct MongoDial {
    uri: String,
}

impl MongoDial {
    pub fn new(config: &Config) -> Self {
        Self { uri: config.uri() }
    }

    async fn ping(&self, db_name: &str) -> Result<Database, mongodb::error::Error> {
        let client = Client::with_uri_str(&self.uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! {"ping": 1}, None).await?;
        Ok(db)
    }
}

#[async_trait]
impl Dial for MongoDial {
    type Conn = Database;

    async fn wait_ready(&self) {
        loop {
            match self.ping("admin").await {
                Ok(_) => return,
                Err(error) => {
                    tracing::debug!(%error, "mongod is not accepting connections yet");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    async fn dial(&self, db_name: &str) -> Result<Database, Error> {
        Ok(self.ping(db_name).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeDial {
        ready_runs: AtomicU32,
        dials: AtomicU32,
    }

    impl FakeDial {
        fn new() -> Self {
            Self {
                ready_runs: AtomicU32::new(0),
                dials: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Dial for FakeDial {
        type Conn = Arc<String>;

        async fn wait_ready(&self) {
            self.ready_runs.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }

        async fn dial(&self, db_name: &str) -> Result<Self::Conn, Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(db_name.to_string()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let pool = ConnectionPool::new(FakeDial::new());

        let (a, b) = tokio::join!(pool.connect("things"), pool.connect("things"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.dial.dials.load(Ordering::SeqCst), 1);

        // A later call observes the same cached connection.
        let c = pool.connect("things").await.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(pool.dial.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_name_fails_without_an_attempt() {
        let pool = ConnectionPool::new(FakeDial::new());

        match pool.connect("").await {
            Err(Error::InvalidDatabaseName) => (),
            other => panic!("expected InvalidDatabaseName, got {other:?}"),
        }
        assert_eq!(pool.dial.dials.load(Ordering::SeqCst), 0);
        assert_eq!(pool.dial.ready_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_readiness_is_memoized_across_names() {
        let pool = ConnectionPool::new(FakeDial::new());

        pool.connect("one").await.unwrap();
        pool.connect("two").await.unwrap();

        assert_eq!(pool.dial.ready_runs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.dial.dials.load(Ordering::SeqCst), 2);
    }
}
