//! Document store driver.
//!
//! Documents live as JSONB rows in one table per collection, inside the tenant's
//! schema. A tenant's pool is a [`DocumentStore`]: the Postgres pool plus the
//! namespace its collections are resolved in.

use crate::backend::{Backend, BackendError};
use crate::metadata::{ConnectionMetadata, StoreKind};
use crate::relational::{connect_postgres, ping_postgres};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("document query failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("document is not valid json for this type: {0}")]
    Json(#[from] serde_json::Error),
}

fn quoted(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn collection_table(namespace: &str, collection: &str) -> String {
    if namespace.is_empty() {
        quoted(collection)
    } else {
        format!("{}.{}", quoted(namespace), quoted(collection))
    }
}

#[derive(Clone, Debug)]
pub struct DocumentStore {
    pool: PgPool,
    namespace: Arc<str>,
}

impl DocumentStore {
    pub fn new(pool: PgPool, namespace: &str) -> Self {
        DocumentStore {
            pool,
            namespace: Arc::from(namespace),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully qualified, quoted table name of a collection.
    pub fn collection_table(&self, collection: &str) -> String {
        collection_table(&self.namespace, collection)
    }

    pub async fn ensure_collection(&self, collection: &str) -> Result<(), DocumentError> {
        let sql = format!(
            "create table if not exists {} (
                id text primary key,
                doc jsonb not null,
                version integer not null default 1,
                updated_at timestamptz not null default now()
            )",
            self.collection_table(collection)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns the document and its version.
    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<(T, i32)>, DocumentError> {
        let sql = format!(
            "select doc, version from {} where id = $1",
            self.collection_table(collection)
        );
        let row: Option<(Value, i32)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((value, version)) => Ok(Some((serde_json::from_value(value)?, version))),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a document, returning its new version.
    pub async fn upsert<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<i32, DocumentError> {
        let json = serde_json::to_value(doc)?;
        let table = self.collection_table(collection);
        let sql = format!(
            "insert into {table} as t (id, doc, version)
             values ($1, $2, 1)
             on conflict (id) do update
               set doc = excluded.doc,
                   version = t.version + 1,
                   updated_at = now()
             returning version"
        );
        let version: i32 = sqlx::query_scalar(&sql)
            .bind(id)
            .bind(&json)
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool, DocumentError> {
        let sql = format!(
            "delete from {} where id = $1",
            self.collection_table(collection)
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentBackend;

#[async_trait]
impl Backend for DocumentBackend {
    type Pool = DocumentStore;

    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    async fn connect(&self, metadata: &ConnectionMetadata) -> Result<DocumentStore, BackendError> {
        let pool = connect_postgres(metadata).await?;
        Ok(DocumentStore::new(pool, &metadata.namespace))
    }

    async fn close(&self, store: &DocumentStore) -> Result<(), BackendError> {
        store.pool.close().await;
        Ok(())
    }

    fn is_healthy(&self, store: &DocumentStore) -> bool {
        !store.pool.is_closed()
    }

    async fn ping(&self, store: &DocumentStore) -> Result<(), BackendError> {
        ping_postgres(&store.pool).await
    }
}
