//! Object storage access layer.
//!
//! This crate provides:
//! - [`StorageUrl`](url::StorageUrl): validated storage locations (`s3://`, `s3a://`, `file://`
//!   or plain filesystem paths).
//! - [`new`]: a factory creating an [`ObjectStore`] for a location.
//! - [`StorageClient`](client::StorageClient): the narrow request/response interface the transfer
//!   engine issues its storage calls through.

use std::sync::Arc;

use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem};

pub mod client;
pub mod url;

pub use self::{
    client::{ListPage, ObjectStoreClient, StorageClient},
    url::{InvalidPathError, StorageProvider, StorageUrl},
};

/// Options applied when building an object store.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct StoreOptions {
    /// KMS key used for server-side encryption of every object written through the store.
    ///
    /// When unset, objects are written with the bucket's default encryption.
    #[serde(default)]
    pub sse_kms_key_id: Option<String>,
}

/// Creates an object store at the bucket root level.
///
/// The URL's path component is ignored - the returned store operates at the bucket root, and
/// callers address objects with [`StorageUrl::object_path`](url::StorageUrl::object_path).
///
/// # Providers configuration
///
/// AWS S3 is configured via `AWS_*` environment variables (e.g. `AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`, `AWS_ENDPOINT`). Credentials are never held in process
/// wide state by this crate; each store owns its own configuration.
pub fn new(
    url: impl AsRef<url::StorageUrl>,
    options: &StoreOptions,
) -> Result<Arc<dyn ObjectStore>, ObjectStoreCreationError> {
    let url = url.as_ref();

    match url.provider() {
        StorageProvider::AmazonS3 => {
            let mut builder = AmazonS3Builder::from_env().with_url(url.as_str());
            if let Some(key_id) = &options.sse_kms_key_id {
                builder = builder.with_sse_kms_encryption(key_id);
            }
            let store = builder.build().map_err(|err| ObjectStoreCreationError {
                url: url.to_string(),
                source: err,
            })?;
            Ok(Arc::new(store))
        }
        StorageProvider::Local => Ok(Arc::new(LocalFileSystem::new())),
    }
}

/// Creates a [`StorageClient`] for the bucket (or filesystem root) addressed by `url`.
///
/// The local filesystem cannot store content types, so objects written to it carry none.
pub fn new_client(
    url: impl AsRef<url::StorageUrl>,
    options: &StoreOptions,
) -> Result<Arc<dyn StorageClient>, ObjectStoreCreationError> {
    let url = url.as_ref();
    let client = ObjectStoreClient::new(new(url, options)?);
    Ok(Arc::new(match url.provider() {
        StorageProvider::AmazonS3 => client,
        StorageProvider::Local => client.without_attributes(),
    }))
}

/// Failed to create object store instance.
///
/// This error occurs when the URL is valid but the underlying provider cannot be initialized.
///
/// Common causes:
/// - **Missing credentials**: Required environment variables not set
/// - **Configuration problems**: Malformed configuration values or unsupported regions
#[derive(Debug, thiserror::Error)]
#[error("failed to create object store for {url}")]
pub struct ObjectStoreCreationError {
    url: String,
    #[source]
    source: object_store::Error,
}
