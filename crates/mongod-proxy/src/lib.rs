//! A database-access proxy over a supervised local `mongod`: it owns the
//! server process, lazily caches one logical connection per database name,
//! normalizes identifier fields in query documents, and tracks live query
//! cursors behind opaque handles for a request/event transport to consume.

use std::sync::Arc;

use tokio::sync::mpsc;

pub mod collection;
pub mod config;
pub mod crud;
pub mod cursor;
pub mod oid;
pub mod pool;
pub mod supervisor;

pub use collection::{CollectionStore, FindArgs};
pub use config::Config;
pub use crud::{BoundCollection, ChangeEvent, CrudManager, Outcome, Payload};
pub use cursor::{CursorEvent, CursorId, CursorRegistry};
pub use oid::coerce_object_ids;
pub use pool::{ConnectionPool, MongoDial};
pub use supervisor::{LogNotifier, Notify, Supervisor};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("database name must be a non-empty string")]
    InvalidDatabaseName,
    #[error("cursor {0} not found")]
    CursorNotFound(CursorId),
    #[error("cursor has already begun streaming")]
    CursorConsumed,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Driver(Arc<mongodb::error::Error>),
}

impl From<mongodb::error::Error> for Error {
    fn from(error: mongodb::error::Error) -> Self {
        Self::Driver(Arc::new(error))
    }
}

impl Error {
    /// Short class name of the error, used in inline batch item records.
    pub fn name(&self) -> &'static str {
        match self {
            Error::InvalidDatabaseName => "InvalidDatabaseName",
            Error::CursorNotFound(_) => "CursorNotFound",
            Error::CursorConsumed => "CursorConsumed",
            Error::Validation(_) => "ValidationError",
            Error::Driver(_) => "DriverError",
        }
    }
}

/// The assembled proxy: supervisor, pool, cursor registry, and operation
/// catalog, constructed once at startup and passed by reference to
/// consumers.
pub struct Proxy {
    supervisor: Supervisor,
    pool: Arc<ConnectionPool<MongoDial>>,
    cursors: Arc<CursorRegistry>,
    store: Arc<CollectionStore>,
}

impl Proxy {
    /// Start the supervised server and wire all components. Returns the
    /// proxy and the cursor event stream for the transport to demultiplex.
    pub async fn load(
        config: Config,
        notifier: Arc<dyn Notify>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<CursorEvent>)> {
        let mut supervisor = Supervisor::new(config.clone(), notifier);
        supervisor.load().await?;

        let pool = Arc::new(ConnectionPool::new(MongoDial::new(&config)));
        let (cursors, cursor_events) = CursorRegistry::new();
        let store = Arc::new(CollectionStore::new(
            pool.clone(),
            cursors.clone(),
            config.default_db.clone(),
        ));

        let proxy = Self {
            supervisor,
            pool,
            cursors,
            store,
        };
        Ok((proxy, cursor_events))
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    pub fn cursors(&self) -> &Arc<CursorRegistry> {
        &self.cursors
    }

    /// Tear down in reverse order of construction: cursors first, then the
    /// connection cache, then the supervised process.
    pub async fn unload(mut self) {
        self.cursors.unload().await;
        self.pool.unload();
        self.supervisor.unload().await;
    }
}
