//! Narrow request/response interface for object storage.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt as _;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload,
    PutResult, path::Path,
};

/// A page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page, sorted by location.
    pub objects: Vec<ObjectMeta>,
    /// Opaque token to pass to the next [`StorageClient::list_page`] call.
    ///
    /// `None` means the listing is exhausted.
    pub next_token: Option<String>,
}

/// The storage operations the transfer engine issues.
///
/// All calls are independent request/response operations against one bucket (or the local
/// filesystem root). Errors are returned as raw [`object_store::Error`] values so the executor can
/// classify them into transient and permanent failures.
#[async_trait::async_trait]
pub trait StorageClient: Send + Sync + std::fmt::Debug {
    /// Reads the entire contents of an object.
    async fn get(&self, location: &Path) -> Result<Bytes, object_store::Error>;

    /// Writes an object, replacing any existing object at the same location.
    async fn put(
        &self,
        location: &Path,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutResult, object_store::Error>;

    /// Deletes an object. Deleting a missing object is not an error for most stores.
    async fn delete(&self, location: &Path) -> Result<(), object_store::Error>;

    /// Copies an object within the same bucket, overwriting the destination.
    async fn copy(&self, from: &Path, to: &Path) -> Result<(), object_store::Error>;

    /// Returns the metadata of an object without fetching its contents.
    async fn head(&self, location: &Path) -> Result<ObjectMeta, object_store::Error>;

    /// Lists one page of objects under `prefix`, resuming after `token` if given.
    async fn list_page(
        &self,
        prefix: &Path,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, object_store::Error>;

    /// Lists every object under `prefix`.
    async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, object_store::Error>;
}

/// [`StorageClient`] backed by an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    attributes: bool,
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            attributes: true,
        }
    }

    /// Stores objects without attributes such as the content type.
    ///
    /// Needed for stores that reject attributes, like the local filesystem.
    pub fn without_attributes(mut self) -> Self {
        self.attributes = false;
        self
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

#[async_trait::async_trait]
impl StorageClient for ObjectStoreClient {
    async fn get(&self, location: &Path) -> Result<Bytes, object_store::Error> {
        self.store.get(location).await?.bytes().await
    }

    async fn put(
        &self,
        location: &Path,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutResult, object_store::Error> {
        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type.filter(|_| self.attributes) {
            attributes.insert(
                Attribute::ContentType,
                AttributeValue::from(content_type.to_string()),
            );
        }
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(location, PutPayload::from(payload), opts)
            .await
    }

    async fn delete(&self, location: &Path) -> Result<(), object_store::Error> {
        match self.store.delete(location).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            result => result,
        }
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), object_store::Error> {
        self.store.copy(from, to).await
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta, object_store::Error> {
        self.store.head(location).await
    }

    async fn list_page(
        &self,
        prefix: &Path,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, object_store::Error> {
        // The continuation token is the last key of the previous page. Not every store lists in
        // key order, so the remainder is sorted before the page is cut from it.
        let stream = match token {
            Some(token) => self
                .store
                .list_with_offset(Some(prefix), &Path::from(token)),
            None => self.store.list(Some(prefix)),
        };
        let mut objects: Vec<ObjectMeta> = stream.try_collect().await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));

        let next_token = if objects.len() > page_size {
            objects.truncate(page_size);
            objects.last().map(|meta| meta.location.to_string())
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, object_store::Error> {
        let mut objects: Vec<ObjectMeta> = self.store.list(Some(prefix)).try_collect().await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }
}
