//! Shared fixtures for dataset integration tests

#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use arrow::array::{ArrayRef, Int64Array, StringArray};
use bytes::Bytes;
use lakeshift_catalog::{
    CatalogError, CatalogPartition, CatalogService, CatalogTable, InMemoryCatalog, TableRef,
};
use lakeshift_executor::{Executor, ExecutorConfig, RetryPolicy, ServiceError};
use lakeshift_object_store::{ListPage, ObjectStoreClient, StorageClient};
use lakeshift_table::Table;
use object_store::{ObjectMeta, PutResult, memory::InMemory, path::Path};

pub const LOCATION: &str = "s3://bucket/sales";

pub fn client() -> Arc<ObjectStoreClient> {
    Arc::new(ObjectStoreClient::new(Arc::new(InMemory::new())))
}

pub fn executor(client: Arc<dyn StorageClient>) -> Executor {
    Executor::new(
        client,
        ExecutorConfig {
            concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                call_timeout: Duration::from_secs(10),
            },
        },
    )
}

/// 10 rows, 3 columns, 2 distinct regions.
pub fn sales() -> Table {
    Table::from_columns([
        (
            "id",
            Arc::new(Int64Array::from((0..10).collect::<Vec<i64>>())) as ArrayRef,
        ),
        (
            "item",
            Arc::new(StringArray::from(
                (0..10).map(|i| format!("item-{i}")).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        (
            "region",
            Arc::new(StringArray::from(vec![
                "eu", "us", "eu", "eu", "us", "us", "eu", "us", "eu", "eu",
            ])) as ArrayRef,
        ),
    ])
    .expect("Failed to build table")
}

/// A table with the `sales` layout and the given rows.
pub fn sales_rows(rows: &[(i64, &str, &str)]) -> Table {
    Table::from_columns([
        (
            "id",
            Arc::new(Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())) as ArrayRef,
        ),
        (
            "item",
            Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())) as ArrayRef,
        ),
        (
            "region",
            Arc::new(StringArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())) as ArrayRef,
        ),
    ])
    .expect("Failed to build table")
}

/// Rows rendered as text, sorted, for order-independent comparison.
pub fn sorted_rows(table: &Table) -> Vec<String> {
    let mut rows: Vec<String> = table.rows().map(|row| format!("{row:?}")).collect();
    rows.sort();
    rows
}

/// Every object under `prefix` with its contents.
pub async fn objects(client: &dyn StorageClient, prefix: &str) -> BTreeMap<String, Bytes> {
    let mut objects = BTreeMap::new();
    for meta in client
        .list(&Path::from(prefix))
        .await
        .expect("Failed to list objects")
    {
        let bytes = client
            .get(&meta.location)
            .await
            .expect("Failed to get object");
        objects.insert(meta.location.to_string(), bytes);
    }
    objects
}

/// Storage client rejecting puts of keys that contain `marker` with an access denied error.
#[derive(Debug)]
pub struct DenyingClient {
    pub inner: ObjectStoreClient,
    pub marker: String,
}

#[async_trait::async_trait]
impl StorageClient for DenyingClient {
    async fn get(&self, location: &Path) -> Result<Bytes, object_store::Error> {
        self.inner.get(location).await
    }

    async fn put(
        &self,
        location: &Path,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutResult, object_store::Error> {
        if location.as_ref().contains(&self.marker) {
            return Err(object_store::Error::PermissionDenied {
                path: location.to_string(),
                source: "Access Denied".into(),
            });
        }
        self.inner.put(location, payload, content_type).await
    }

    async fn delete(&self, location: &Path) -> Result<(), object_store::Error> {
        self.inner.delete(location).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), object_store::Error> {
        self.inner.copy(from, to).await
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta, object_store::Error> {
        self.inner.head(location).await
    }

    async fn list_page(
        &self,
        prefix: &Path,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, object_store::Error> {
        self.inner.list_page(prefix, token, page_size).await
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, object_store::Error> {
        self.inner.list(prefix).await
    }
}

/// Storage client whose deletes are all denied.
#[derive(Debug)]
pub struct UndeletableClient {
    pub inner: ObjectStoreClient,
}

#[async_trait::async_trait]
impl StorageClient for UndeletableClient {
    async fn get(&self, location: &Path) -> Result<Bytes, object_store::Error> {
        self.inner.get(location).await
    }

    async fn put(
        &self,
        location: &Path,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutResult, object_store::Error> {
        self.inner.put(location, payload, content_type).await
    }

    async fn delete(&self, location: &Path) -> Result<(), object_store::Error> {
        Err(object_store::Error::PermissionDenied {
            path: location.to_string(),
            source: "Access Denied".into(),
        })
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), object_store::Error> {
        self.inner.copy(from, to).await
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta, object_store::Error> {
        self.inner.head(location).await
    }

    async fn list_page(
        &self,
        prefix: &Path,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, object_store::Error> {
        self.inner.list_page(prefix, token, page_size).await
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, object_store::Error> {
        self.inner.list(prefix).await
    }
}

/// In-memory catalog that can be read but rejects new tables.
#[derive(Debug, Default)]
pub struct ReadOnlyCatalog {
    pub inner: InMemoryCatalog,
}

#[async_trait::async_trait]
impl CatalogService for ReadOnlyCatalog {
    async fn get_table(&self, table: &TableRef) -> Result<Option<CatalogTable>, CatalogError> {
        self.inner.get_table(table).await
    }

    async fn get_partitions(
        &self,
        table: &TableRef,
    ) -> Result<Vec<CatalogPartition>, CatalogError> {
        self.inner.get_partitions(table).await
    }

    async fn create_table(&self, _: CatalogTable) -> Result<(), CatalogError> {
        Err(ServiceError::permanent_message("catalog is read-only").into())
    }

    async fn update_table(&self, _: CatalogTable) -> Result<(), CatalogError> {
        Err(ServiceError::permanent_message("catalog is read-only").into())
    }

    async fn delete_table(&self, _: &TableRef) -> Result<(), CatalogError> {
        Err(ServiceError::permanent_message("catalog is read-only").into())
    }

    async fn batch_create_partitions(
        &self,
        _: &TableRef,
        _: Vec<CatalogPartition>,
    ) -> Result<(), CatalogError> {
        Err(ServiceError::permanent_message("catalog is read-only").into())
    }

    async fn batch_delete_partitions(
        &self,
        _: &TableRef,
        _: Vec<Vec<String>>,
    ) -> Result<(), CatalogError> {
        Err(ServiceError::permanent_message("catalog is read-only").into())
    }
}

/// Catalog whose every call fails.
#[derive(Debug, Default)]
pub struct UnavailableCatalog;

impl UnavailableCatalog {
    fn error() -> CatalogError {
        ServiceError::permanent_message("catalog unavailable").into()
    }
}

#[async_trait::async_trait]
impl CatalogService for UnavailableCatalog {
    async fn get_table(&self, _: &TableRef) -> Result<Option<CatalogTable>, CatalogError> {
        Err(Self::error())
    }

    async fn get_partitions(&self, _: &TableRef) -> Result<Vec<CatalogPartition>, CatalogError> {
        Err(Self::error())
    }

    async fn create_table(&self, _: CatalogTable) -> Result<(), CatalogError> {
        Err(Self::error())
    }

    async fn update_table(&self, _: CatalogTable) -> Result<(), CatalogError> {
        Err(Self::error())
    }

    async fn delete_table(&self, _: &TableRef) -> Result<(), CatalogError> {
        Err(Self::error())
    }

    async fn batch_create_partitions(
        &self,
        _: &TableRef,
        _: Vec<CatalogPartition>,
    ) -> Result<(), CatalogError> {
        Err(Self::error())
    }

    async fn batch_delete_partitions(
        &self,
        _: &TableRef,
        _: Vec<Vec<String>>,
    ) -> Result<(), CatalogError> {
        Err(Self::error())
    }
}
