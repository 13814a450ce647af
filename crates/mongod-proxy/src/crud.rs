use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};

use crate::collection::{CollectionStore, FindArgs};
use crate::Error;

/// A request body that is either a single item or a batch of items.
/// The two shapes are handled by distinct code paths with distinct
/// result and error semantics.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum Payload<T> {
    Many(Vec<T>),
    One(T),
}

/// Inline error record standing in for a failed item of a batch result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ItemError {
    #[serde(rename = "$isError")]
    pub is_error: bool,
    pub message: String,
    pub name: String,
}

impl From<Error> for ItemError {
    fn from(error: Error) -> Self {
        Self {
            is_error: true,
            message: error.to_string(),
            name: error.name().to_string(),
        }
    }
}

/// Positional outcome of one item of a batch: the affected document, a
/// null for a non-match, or an inline error record.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Document(Document),
    Missing,
    Error(ItemError),
}

impl ItemOutcome {
    fn from_result(result: Result<Option<Document>, Error>) -> Self {
        match result {
            Ok(Some(document)) => ItemOutcome::Document(document),
            Ok(None) => ItemOutcome::Missing,
            Err(error) => {
                tracing::error!(%error, "batch item failed");
                ItemOutcome::Error(error.into())
            }
        }
    }
}

/// Result of a CRUD call, mirroring the shape of its payload. A single
/// update or delete that matched nothing carries `None` and serializes
/// as null.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum Outcome {
    One(Option<Document>),
    Many(Vec<ItemOutcome>),
}

/// Change notifications published after successful writes. Batch events
/// carry the same positional outcome list the caller receives.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created(Vec<ItemOutcome>),
    Updated(Vec<ItemOutcome>),
    Deleted(Vec<ItemOutcome>),
}

/// Persistence seam of the CRUD manager: one collection's worth of
/// storage, addressed by document id.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Insert and return the stored document, id included.
    async fn insert_one(&self, document: Document) -> Result<Document, Error>;
    async fn count(&self, filter: Document) -> Result<u64, Error>;
    async fn find(&self, filter: Document, args: FindArgs) -> Result<Vec<Document>, Error>;
    async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error>;
    /// Apply `update` to the document with `id`, returning the updated
    /// document, or `None` when no document matched.
    async fn update_by_id(&self, id: Bson, update: Document) -> Result<Option<Document>, Error>;
    /// Delete the document with `id`, returning it, or `None` when no
    /// document matched.
    async fn delete_by_id(&self, id: Bson) -> Result<Option<Document>, Error>;
}

/// `DocumentStore` over one named collection of the operation catalog.
pub struct BoundCollection {
    store: Arc<CollectionStore>,
    db_name: Option<String>,
    collection: String,
}

impl BoundCollection {
    pub fn new(store: Arc<CollectionStore>, db_name: Option<String>, collection: String) -> Self {
        Self {
            store,
            db_name,
            collection,
        }
    }

    fn db_name(&self) -> Option<&str> {
        self.db_name.as_deref()
    }
}

#[async_trait]
impl DocumentStore for BoundCollection {
    async fn insert_one(&self, mut document: Document) -> Result<Document, Error> {
        let inserted = self
            .store
            .insert_one(self.db_name(), &self.collection, document.clone())
            .await?;
        if !document.contains_key("_id") {
            document.insert("_id", inserted.inserted_id);
        }
        Ok(document)
    }

    async fn count(&self, filter: Document) -> Result<u64, Error> {
        self.store
            .count(self.db_name(), &self.collection, filter)
            .await
    }

    async fn find(&self, filter: Document, args: FindArgs) -> Result<Vec<Document>, Error> {
        self.store
            .find(self.db_name(), &self.collection, filter, args)
            .await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error> {
        self.store
            .find_one(self.db_name(), &self.collection, filter, None)
            .await
    }

    async fn update_by_id(&self, id: Bson, update: Document) -> Result<Option<Document>, Error> {
        self.store
            .find_one_and_update(self.db_name(), &self.collection, doc! {"_id": id}, update)
            .await
    }

    async fn delete_by_id(&self, id: Bson) -> Result<Option<Document>, Error> {
        self.store
            .find_one_and_delete(self.db_name(), &self.collection, doc! {"_id": id})
            .await
    }
}

/// Admission check run on every document before it is written.
pub trait Validate: Send + Sync + 'static {
    fn validate(&self, document: &Document) -> Result<(), Error>;
}

/// Validator admitting everything.
pub struct AcceptAll;

impl Validate for AcceptAll {
    fn validate(&self, _document: &Document) -> Result<(), Error> {
        Ok(())
    }
}

/// Validated CRUD over a single document store, with batch semantics:
/// batches run their items concurrently, record per-item failures inline
/// rather than failing the whole call, and are serialized against other
/// batches so interleavings of two batch writes cannot occur.
pub struct CrudManager {
    store: Arc<dyn DocumentStore>,
    validator: Arc<dyn Validate>,
    batch_lock: tokio::sync::Mutex<()>,
    changes: tokio::sync::mpsc::UnboundedSender<ChangeEvent>,
}

impl CrudManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>) {
        Self::with_validator(store, Arc::new(AcceptAll))
    }

    pub fn with_validator(
        store: Arc<dyn DocumentStore>,
        validator: Arc<dyn Validate>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>) {
        let (changes, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                store,
                validator,
                batch_lock: tokio::sync::Mutex::new(()),
                changes,
            },
            rx,
        )
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscriber is fine; changes are advisory.
        let _ = self.changes.send(event);
    }

    async fn create_one(&self, document: Document) -> Result<Document, Error> {
        self.validator.validate(&document)?;
        self.store.insert_one(document).await
    }

    pub async fn create(&self, payload: Payload<Document>) -> Result<Outcome, Error> {
        match payload {
            Payload::One(document) => {
                let created = self.create_one(document).await?;
                self.publish(ChangeEvent::Created(vec![ItemOutcome::Document(
                    created.clone(),
                )]));
                Ok(Outcome::One(Some(created)))
            }
            Payload::Many(documents) => {
                let _guard = self.batch_lock.lock().await;
                let outcomes = futures::future::join_all(documents.into_iter().map(|document| {
                    async move {
                        ItemOutcome::from_result(self.create_one(document).await.map(Some))
                    }
                }))
                .await;
                self.publish(ChangeEvent::Created(outcomes.clone()));
                Ok(Outcome::Many(outcomes))
            }
        }
    }

    pub async fn count(&self, filter: Document) -> Result<u64, Error> {
        self.store.count(filter).await
    }

    pub async fn list(&self, filter: Document, args: FindArgs) -> Result<Vec<Document>, Error> {
        self.store.find(filter, args).await
    }

    pub async fn get(&self, filter: Document) -> Result<Option<Document>, Error> {
        self.store.find_one(filter).await
    }

    async fn update_one(&self, id: Bson, update: Document) -> Result<Option<Document>, Error> {
        self.validator.validate(&update)?;
        self.store.update_by_id(id, update).await
    }

    pub async fn update(
        &self,
        payload: Payload<(Bson, Document)>,
    ) -> Result<Outcome, Error> {
        match payload {
            Payload::One((id, update)) => {
                let updated = self.update_one(id, update).await?;
                if let Some(updated) = &updated {
                    self.publish(ChangeEvent::Updated(vec![ItemOutcome::Document(
                        updated.clone(),
                    )]));
                }
                Ok(Outcome::One(updated))
            }
            Payload::Many(updates) => {
                let _guard = self.batch_lock.lock().await;
                let outcomes = futures::future::join_all(updates.into_iter().map(
                    |(id, update)| async move {
                        ItemOutcome::from_result(self.update_one(id, update).await)
                    },
                ))
                .await;
                self.publish(ChangeEvent::Updated(outcomes.clone()));
                Ok(Outcome::Many(outcomes))
            }
        }
    }

    pub async fn delete(&self, payload: Payload<Bson>) -> Result<Outcome, Error> {
        match payload {
            Payload::One(id) => {
                let deleted = self.store.delete_by_id(id).await?;
                if let Some(deleted) = &deleted {
                    self.publish(ChangeEvent::Deleted(vec![ItemOutcome::Document(
                        deleted.clone(),
                    )]));
                }
                Ok(Outcome::One(deleted))
            }
            Payload::Many(ids) => {
                let _guard = self.batch_lock.lock().await;
                let outcomes = futures::future::join_all(ids.into_iter().map(|id| async move {
                    ItemOutcome::from_result(self.store.delete_by_id(id).await)
                }))
                .await;
                self.publish(ChangeEvent::Deleted(outcomes.clone()));
                Ok(Outcome::Many(outcomes))
            }
        }
    }
}

// ItemOutcome::Missing serializes as JSON null to hold its position in a
// batch result.
impl serde::Serialize for ItemOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ItemOutcome::Document(document) => document.serialize(serializer),
            ItemOutcome::Missing => serializer.serialize_none(),
            ItemOutcome::Error(error) => error.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemoryStore {
        documents: Mutex<HashMap<String, Document>>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                documents: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn insert_one(&self, mut document: Document) -> Result<Document, Error> {
            let id = ObjectId::new();
            document.insert("_id", id);
            self.documents
                .lock()
                .unwrap()
                .insert(id.to_hex(), document.clone());
            Ok(document)
        }

        async fn count(&self, _filter: Document) -> Result<u64, Error> {
            Ok(self.documents.lock().unwrap().len() as u64)
        }

        async fn find(&self, _filter: Document, _args: FindArgs) -> Result<Vec<Document>, Error> {
            Ok(self.documents.lock().unwrap().values().cloned().collect())
        }

        async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error> {
            let documents = self.documents.lock().unwrap();
            Ok(documents
                .values()
                .find(|document| filter.iter().all(|(k, v)| document.get(k) == Some(v)))
                .cloned())
        }

        async fn update_by_id(
            &self,
            id: Bson,
            update: Document,
        ) -> Result<Option<Document>, Error> {
            let Bson::ObjectId(id) = id else {
                return Ok(None);
            };
            let mut documents = self.documents.lock().unwrap();
            let Some(document) = documents.get_mut(&id.to_hex()) else {
                return Ok(None);
            };
            if let Ok(set) = update.get_document("$set") {
                for (key, value) in set {
                    document.insert(key, value.clone());
                }
            }
            Ok(Some(document.clone()))
        }

        async fn delete_by_id(&self, id: Bson) -> Result<Option<Document>, Error> {
            let Bson::ObjectId(id) = id else {
                return Ok(None);
            };
            Ok(self.documents.lock().unwrap().remove(&id.to_hex()))
        }
    }

    struct RejectNamed(&'static str);

    impl Validate for RejectNamed {
        fn validate(&self, document: &Document) -> Result<(), Error> {
            match document.get_str("name") {
                Ok(name) if name == self.0 => {
                    Err(Error::Validation(format!("name {name:?} is not allowed")))
                }
                _ => Ok(()),
            }
        }
    }

    fn stored_id(outcome: &ItemOutcome) -> Bson {
        match outcome {
            ItemOutcome::Document(document) => document.get("_id").cloned().unwrap(),
            other => panic!("expected a document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_create_records_failures_inline() {
        let store = MemoryStore::new();
        let (crud, mut changes) =
            CrudManager::with_validator(store.clone(), Arc::new(RejectNamed("bad")));

        let outcome = crud
            .create(Payload::Many(vec![
                doc! {"name": "a"},
                doc! {"name": "bad"},
                doc! {"name": "c"},
            ]))
            .await
            .unwrap();

        let Outcome::Many(outcomes) = outcome else {
            panic!("expected a batch outcome")
        };
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0], ItemOutcome::Document(_)));
        match &outcomes[1] {
            ItemOutcome::Error(error) => {
                assert!(error.is_error);
                assert_eq!(error.name, "ValidationError");
            }
            other => panic!("expected an inline error, got {other:?}"),
        }
        assert!(matches!(&outcomes[2], ItemOutcome::Document(_)));

        // The admitted documents are stored; the rejected one is not.
        assert_eq!(crud.count(doc! {}).await.unwrap(), 2);

        // One change event carrying the same positional outcomes.
        match changes.recv().await.unwrap() {
            ChangeEvent::Created(events) => assert_eq!(events.len(), 3),
            other => panic!("unexpected change event {other:?}"),
        }
    }

    #[test]
    fn test_inline_error_serialization_shape() {
        let error = ItemError::from(Error::Validation("nope".to_string()));
        let value = serde_json::to_value(&ItemOutcome::Error(error)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "$isError": true,
                "message": "validation failed: nope",
                "name": "ValidationError",
            })
        );
        assert_eq!(
            serde_json::to_value(&ItemOutcome::Missing).unwrap(),
            serde_json::Value::Null
        );
    }

    #[tokio::test]
    async fn test_single_invalid_create_is_an_error() {
        let store = MemoryStore::new();
        let (crud, mut changes) =
            CrudManager::with_validator(store, Arc::new(RejectNamed("bad")));

        match crud.create(Payload::One(doc! {"name": "bad"})).await {
            Err(Error::Validation(_)) => (),
            other => panic!("expected a validation error, got {other:?}"),
        }
        assert_eq!(crud.count(doc! {}).await.unwrap(), 0);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_update_yields_nulls_for_missing_ids() {
        let store = MemoryStore::new();
        let (crud, mut changes) = CrudManager::new(store);

        let created = crud
            .create(Payload::Many(vec![doc! {"name": "a"}]))
            .await
            .unwrap();
        let Outcome::Many(created) = created else {
            panic!("expected a batch outcome")
        };
        let id = stored_id(&created[0]);
        changes.recv().await.unwrap();

        let outcome = crud
            .update(Payload::Many(vec![
                (id, doc! {"$set": {"name": "a2"}}),
                (
                    Bson::ObjectId(ObjectId::new()),
                    doc! {"$set": {"name": "ghost"}},
                ),
            ]))
            .await
            .unwrap();

        let Outcome::Many(outcomes) = outcome else {
            panic!("expected a batch outcome")
        };
        match &outcomes[0] {
            ItemOutcome::Document(document) => {
                assert_eq!(document.get_str("name").unwrap(), "a2")
            }
            other => panic!("expected a document, got {other:?}"),
        }
        assert!(matches!(&outcomes[1], ItemOutcome::Missing));

        match changes.recv().await.unwrap() {
            ChangeEvent::Updated(events) => assert_eq!(events.len(), 2),
            other => panic!("unexpected change event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_round_trip_publishes_changes() {
        let store = MemoryStore::new();
        let (crud, mut changes) = CrudManager::new(store);

        let created = crud.create(Payload::One(doc! {"name": "a"})).await.unwrap();
        let Outcome::One(Some(created)) = created else {
            panic!("expected a single outcome")
        };
        let id = created.get("_id").cloned().unwrap();
        changes.recv().await.unwrap();

        let deleted = crud.delete(Payload::One(id.clone())).await.unwrap();
        let Outcome::One(Some(deleted)) = deleted else {
            panic!("expected a single outcome")
        };
        assert_eq!(deleted.get("_id"), Some(&id));
        assert_eq!(crud.count(doc! {}).await.unwrap(), 0);

        match changes.recv().await.unwrap() {
            ChangeEvent::Deleted(events) => assert_eq!(events.len(), 1),
            other => panic!("unexpected change event {other:?}"),
        }

        // Deleting it again matches nothing, yields null, and publishes
        // nothing.
        let missing = crud.delete(Payload::One(id)).await.unwrap();
        assert!(matches!(missing, Outcome::One(None)));
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            serde_json::Value::Null
        );
        assert!(changes.try_recv().is_err());
    }
}
