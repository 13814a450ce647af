use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOneOptions, FindOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};

use crate::cursor::{CursorId, CursorRegistry, FindCursor};
use crate::oid::coerce_object_ids;
use crate::pool::{ConnectionPool, MongoDial};
use crate::Error;

/// Projection and paging arguments shared by the query operations.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct FindArgs {
    pub projection: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub sort: Option<Document>,
}

impl FindArgs {
    fn into_options(self) -> FindOptions {
        let mut options = FindOptions::default();
        options.projection = self.projection;
        options.limit = self.limit;
        options.skip = self.skip;
        options.sort = self.sort;
        options
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InsertedOne {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InsertedMany {
    pub inserted_count: u64,
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Updated {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Deleted {
    pub deleted_count: u64,
}

/// The full per-collection operation catalog. Every operation resolves its
/// database through the pool, so the first touch of a database name blocks
/// on server readiness and later touches reuse the cached connection.
/// Filters are identifier-coerced before they reach the driver.
pub struct CollectionStore {
    pool: Arc<ConnectionPool<MongoDial>>,
    cursors: Arc<CursorRegistry>,
    default_db: String,
}

impl CollectionStore {
    pub fn new(
        pool: Arc<ConnectionPool<MongoDial>>,
        cursors: Arc<CursorRegistry>,
        default_db: String,
    ) -> Self {
        Self {
            pool,
            cursors,
            default_db,
        }
    }

    async fn database(&self, db_name: Option<&str>) -> Result<Database, Error> {
        self.pool
            .connect(db_name.unwrap_or(&self.default_db))
            .await
    }

    async fn collection(
        &self,
        db_name: Option<&str>,
        collection: &str,
    ) -> Result<Collection<Document>, Error> {
        Ok(self.database(db_name).await?.collection(collection))
    }

    pub async fn aggregate(
        &self,
        db_name: Option<&str>,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>, Error> {
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.aggregate(pipeline, None).await?.try_collect().await?)
    }

    pub async fn count(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
    ) -> Result<u64, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.count_documents(filter, None).await?)
    }

    pub async fn create_index(
        &self,
        db_name: Option<&str>,
        collection: &str,
        keys: Document,
    ) -> Result<String, Error> {
        let coll = self.collection(db_name, collection).await?;
        let index = IndexModel::builder().keys(keys).build();
        Ok(coll.create_index(index, None).await?.index_name)
    }

    pub async fn create_indexes(
        &self,
        db_name: Option<&str>,
        collection: &str,
        keys: Vec<Document>,
    ) -> Result<Vec<String>, Error> {
        let coll = self.collection(db_name, collection).await?;
        let indexes = keys
            .into_iter()
            .map(|keys| IndexModel::builder().keys(keys).build());
        Ok(coll.create_indexes(indexes, None).await?.index_names)
    }

    pub async fn delete_many(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
    ) -> Result<Deleted, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let result = coll.delete_many(filter, None).await?;
        Ok(Deleted {
            deleted_count: result.deleted_count,
        })
    }

    pub async fn delete_one(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
    ) -> Result<Deleted, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let result = coll.delete_one(filter, None).await?;
        Ok(Deleted {
            deleted_count: result.deleted_count,
        })
    }

    pub async fn distinct(
        &self,
        db_name: Option<&str>,
        collection: &str,
        field: &str,
        mut filter: Document,
    ) -> Result<Vec<Bson>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.distinct(field, filter, None).await?)
    }

    pub async fn drop(&self, db_name: Option<&str>, collection: &str) -> Result<(), Error> {
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.drop(None).await?)
    }

    pub async fn drop_index(
        &self,
        db_name: Option<&str>,
        collection: &str,
        index_name: &str,
    ) -> Result<(), Error> {
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.drop_index(index_name, None).await?)
    }

    pub async fn drop_indexes(
        &self,
        db_name: Option<&str>,
        collection: &str,
    ) -> Result<(), Error> {
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.drop_indexes(None).await?)
    }

    /// Eager query: materialize all matching documents at once.
    pub async fn find(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        args: FindArgs,
    ) -> Result<Vec<Document>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        Ok(coll
            .find(filter, args.into_options())
            .await?
            .try_collect()
            .await?)
    }

    /// Lazy query: register a cursor and return its handle. The query does
    /// not execute until the cursor is first consumed, so the handle can
    /// still be configured with `limit`, `skip`, and `sort`.
    pub async fn find_cursor(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        args: FindArgs,
    ) -> Result<CursorId, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let cursor = FindCursor::new(coll, filter, args.into_options());
        Ok(self.cursors.create(Box::new(cursor)))
    }

    pub async fn find_one(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let mut options = FindOneOptions::default();
        options.projection = projection;
        Ok(coll.find_one(filter, options).await?)
    }

    pub async fn find_one_and_delete(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
    ) -> Result<Option<Document>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.find_one_and_delete(filter, None).await?)
    }

    pub async fn find_one_and_replace(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        replacement: Document,
    ) -> Result<Option<Document>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        Ok(coll.find_one_and_replace(filter, replacement, None).await?)
    }

    /// Returns the post-update document.
    pub async fn find_one_and_update(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        update: Document,
    ) -> Result<Option<Document>, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(coll.find_one_and_update(filter, update, options).await?)
    }

    /// True only when every named index exists on the collection.
    pub async fn index_exists(
        &self,
        db_name: Option<&str>,
        collection: &str,
        index_names: &[String],
    ) -> Result<bool, Error> {
        let coll = self.collection(db_name, collection).await?;
        let existing = coll.list_index_names().await?;
        Ok(index_names.iter().all(|name| existing.contains(name)))
    }

    /// Index name to key-specification map.
    pub async fn index_information(
        &self,
        db_name: Option<&str>,
        collection: &str,
    ) -> Result<HashMap<String, Document>, Error> {
        let coll = self.collection(db_name, collection).await?;
        let mut indexes = coll.list_indexes(None).await?;
        let mut information = HashMap::new();
        while let Some(index) = indexes.try_next().await? {
            let name = index
                .options
                .as_ref()
                .and_then(|options| options.name.clone())
                .unwrap_or_default();
            information.insert(name, index.keys);
        }
        Ok(information)
    }

    pub async fn indexes(
        &self,
        db_name: Option<&str>,
        collection: &str,
    ) -> Result<Vec<Document>, Error> {
        let coll = self.collection(db_name, collection).await?;
        let mut cursor = coll.list_indexes(None).await?;
        let mut indexes = Vec::new();
        while let Some(index) = cursor.try_next().await? {
            let name = index
                .options
                .as_ref()
                .and_then(|options| options.name.clone())
                .unwrap_or_default();
            indexes.push(doc! {"key": index.keys, "name": name});
        }
        Ok(indexes)
    }

    pub async fn insert_many(
        &self,
        db_name: Option<&str>,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertedMany, Error> {
        let coll = self.collection(db_name, collection).await?;
        let result = coll.insert_many(documents, None).await?;
        // The driver keys inserted ids by input position; order them.
        let mut by_index: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        by_index.sort_by_key(|(index, _)| *index);
        let inserted_ids: Vec<Bson> = by_index.into_iter().map(|(_, id)| id).collect();
        Ok(InsertedMany {
            inserted_count: inserted_ids.len() as u64,
            inserted_ids,
        })
    }

    pub async fn insert_one(
        &self,
        db_name: Option<&str>,
        collection: &str,
        document: Document,
    ) -> Result<InsertedOne, Error> {
        let coll = self.collection(db_name, collection).await?;
        let result = coll.insert_one(document, None).await?;
        Ok(InsertedOne {
            inserted_id: result.inserted_id,
        })
    }

    pub async fn re_index(
        &self,
        db_name: Option<&str>,
        collection: &str,
    ) -> Result<Document, Error> {
        let db = self.database(db_name).await?;
        Ok(db.run_command(doc! {"reIndex": collection}, None).await?)
    }

    pub async fn replace_one(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        replacement: Document,
    ) -> Result<Updated, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let result = coll.replace_one(filter, replacement, None).await?;
        Ok(Updated {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    pub async fn stats(&self, db_name: Option<&str>, collection: &str) -> Result<Document, Error> {
        let db = self.database(db_name).await?;
        Ok(db.run_command(doc! {"collStats": collection}, None).await?)
    }

    pub async fn update_many(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        update: Document,
    ) -> Result<Updated, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let result = coll.update_many(filter, update, None).await?;
        Ok(Updated {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    pub async fn update_one(
        &self,
        db_name: Option<&str>,
        collection: &str,
        mut filter: Document,
        update: Document,
    ) -> Result<Updated, Error> {
        coerce_object_ids(&mut filter);
        let coll = self.collection(db_name, collection).await?;
        let result = coll.update_one(filter, update, None).await?;
        Ok(Updated {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }
}
