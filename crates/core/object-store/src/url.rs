//! Validated storage URL wrapper and provider types.

use std::path::PathBuf;

use fs_err as fs;
use object_store::path::Path;
use url::Url;

/// A validated URL that addresses a location (a "directory" or a single object) in object storage.
///
/// Storage URLs are the only way callers name locations. Every write target, read source,
/// staging prefix and unload destination is parsed into a [`StorageUrl`] before any request is
/// issued, so a malformed location fails fast with an [`InvalidPathError`].
#[derive(Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StorageUrl(Url);

impl StorageUrl {
    /// Creates a new [`StorageUrl`] from a string that can be either a URL or filesystem path.
    pub fn new(location: impl Into<String>) -> Result<Self, InvalidPathError> {
        Self::new_with_base(location, None)
    }

    /// Creates a new [`StorageUrl`] from a string that can be either a URL or filesystem path.
    ///
    /// If `location` is a relative filesystem path, then `base` will be used as the prefix.
    pub fn new_with_base(
        location: impl Into<String>,
        base: Option<&std::path::Path>,
    ) -> Result<Self, InvalidPathError> {
        let location = location.into();
        if location.trim().is_empty() {
            return Err(InvalidPathError::Empty);
        }

        // If the location fails to parse as a URL, we assume it's a filesystem path.
        Self::try_from_url(&location).or_else(|err| match err {
            InvalidPathError::UrlParseError(_) => {
                Self::try_from_filesystem_path(&location, base)
            }
            err => Err(err),
        })
    }

    /// Parses a string as a URL and validates it for storage use.
    ///
    /// The URL must have a supported scheme (`file://`, `s3://`, `s3a://`) and, for object
    /// storage schemes, a non-empty bucket.
    fn try_from_url(url: impl AsRef<str>) -> Result<Self, InvalidPathError> {
        let inner = Url::parse(url.as_ref()).map_err(InvalidPathError::UrlParseError)?;
        Self::validate(inner)
    }

    fn validate(inner: Url) -> Result<Self, InvalidPathError> {
        let provider: StorageProvider = inner.scheme().parse()?;

        if provider == StorageProvider::AmazonS3
            && inner.host_str().is_none_or(|bucket| bucket.is_empty())
        {
            return Err(InvalidPathError::MissingBucket {
                url: inner.to_string(),
            });
        }

        if inner.query().is_some() || inner.fragment().is_some() {
            return Err(InvalidPathError::UnexpectedComponents {
                url: inner.to_string(),
            });
        }

        Ok(Self(inner))
    }

    /// Parses a string as a filesystem path and converts it to a `file://` URL.
    ///
    /// If the path is relative, `base` will be used as the prefix, otherwise
    /// `base` is ignored.
    ///
    /// The path must exist and must be canonicalized to an absolute path.
    fn try_from_filesystem_path(
        location: impl AsRef<str>,
        base: Option<&std::path::Path>,
    ) -> Result<Self, InvalidPathError> {
        let mut path = PathBuf::from(location.as_ref());
        if !path.is_absolute()
            && let Some(base) = base
        {
            path = PathBuf::from(base).join(path);
        }

        let canonical_path = fs::canonicalize(&path)
            .map_err(|err| InvalidPathError::InvalidFilesystemPath { path, source: err })?;

        let url = Url::from_directory_path(&canonical_path).map_err(|_| {
            InvalidPathError::InvalidFilesystemPath {
                path: canonical_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "absolute path could not be resolved",
                ),
            }
        })?;

        Ok(Self(url))
    }

    /// Returns the [`StorageProvider`] of the URL.
    pub fn provider(&self) -> StorageProvider {
        match self.0.scheme() {
            s if StorageProvider::is_local_filesystem(s) => StorageProvider::Local,
            s if StorageProvider::is_amazon_s3(s) => StorageProvider::AmazonS3,
            _ => unreachable!(), // We validate the scheme previously.
        }
    }

    /// Returns the bucket name for object storage URLs, `None` for local filesystem URLs.
    pub fn bucket(&self) -> Option<&str> {
        match self.provider() {
            StorageProvider::AmazonS3 => self.0.host_str(),
            StorageProvider::Local => None,
        }
    }

    /// Returns the object path addressed by this URL, relative to the bucket root.
    ///
    /// Leading and trailing slashes are stripped, so `s3://bucket/a/b/` and `s3://bucket/a/b`
    /// both map to `a/b`.
    pub fn object_path(&self) -> Result<Path, InvalidPathError> {
        Path::from_url_path(self.0.path()).map_err(|err| InvalidPathError::InvalidObjectPath {
            url: self.0.to_string(),
            source: err,
        })
    }

    /// Returns a URL for the "directory" form of this location (always ends with `/`).
    pub fn as_prefix(&self) -> StorageUrl {
        if self.0.path().ends_with('/') {
            return self.clone();
        }
        let mut url = self.0.clone();
        url.set_path(&format!("{}/", self.0.path()));
        StorageUrl(url)
    }

    /// Builds the URL of `location` within the same bucket (or filesystem root).
    pub fn with_object_path(&self, location: &Path) -> StorageUrl {
        let mut url = self.0.clone();
        url.set_path(&format!("/{location}"));
        StorageUrl(url)
    }

    /// Consumes self and returns the inner [`Url`].
    pub fn into_url(self) -> Url {
        self.0
    }
}

impl AsRef<StorageUrl> for StorageUrl {
    fn as_ref(&self) -> &StorageUrl {
        self
    }
}

impl std::ops::Deref for StorageUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Url> for StorageUrl {
    type Error = InvalidPathError;

    fn try_from(value: Url) -> Result<Self, Self::Error> {
        Self::validate(value)
    }
}

impl std::str::FromStr for StorageUrl {
    type Err = InvalidPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
            .map_err(InvalidPathError::UrlParseError)?
            .try_into()
    }
}

impl std::fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for StorageUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl From<&StorageUrl> for String {
    fn from(value: &StorageUrl) -> Self {
        value.to_string()
    }
}

impl serde::Serialize for StorageUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.as_str().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for StorageUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        StorageUrl::new(value).map_err(serde::de::Error::custom)
    }
}

/// Supported storage providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    /// Local filesystem (`file://`)
    Local,

    /// Amazon S3 (`s3://`, `s3a://`)
    AmazonS3,
}

impl StorageProvider {
    /// Returns `true` if the scheme is one of:
    /// - `s3://`
    /// - `s3a://`
    ///
    /// This is used for Amazon S3 and S3-compatible object stores.
    #[inline]
    fn is_amazon_s3(s: impl AsRef<str>) -> bool {
        let scheme = s.as_ref();
        scheme.eq_ignore_ascii_case("s3") || scheme.eq_ignore_ascii_case("s3a")
    }

    /// Returns `true` if the scheme is `file://`.
    #[inline]
    fn is_local_filesystem(s: impl AsRef<str>) -> bool {
        s.as_ref().eq_ignore_ascii_case("file")
    }
}

impl std::str::FromStr for StorageProvider {
    type Err = InvalidPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if StorageProvider::is_local_filesystem(s) => Ok(StorageProvider::Local),
            s if StorageProvider::is_amazon_s3(s) => Ok(StorageProvider::AmazonS3),
            _ => Err(InvalidPathError::UnsupportedScheme {
                scheme: s.to_string(),
            }),
        }
    }
}

/// A storage location could not be interpreted as a valid storage URI.
///
/// Returned by every component that accepts a location from a caller: the key planner, the
/// dataset writer and reader, the unload directive and the warehouse bulk commands.
#[derive(Debug, thiserror::Error)]
pub enum InvalidPathError {
    /// The location string is empty or whitespace only.
    #[error("storage location is empty")]
    Empty,

    /// URL string has invalid syntax and cannot be parsed
    ///
    /// Common causes:
    /// - Missing scheme separator (e.g., `s3//bucket` instead of `s3://bucket`)
    /// - Invalid characters in the URL components
    #[error(transparent)]
    UrlParseError(url::ParseError),

    /// URL scheme is not supported
    ///
    /// Supported schemes:
    /// - `file://` - Local filesystem
    /// - `s3://` or `s3a://` - Amazon S3 and S3-compatible stores
    ///
    /// To use an S3-compatible store with a custom HTTP endpoint, use the `s3://` scheme and
    /// set `AWS_ENDPOINT`.
    #[error("unsupported storage scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    /// An object storage URL does not name a bucket (e.g. `s3:///prefix`).
    #[error("storage url has no bucket: {url}")]
    MissingBucket { url: String },

    /// The URL carries a query string or fragment, which have no meaning for storage keys.
    #[error("storage url must not contain a query or fragment: {url}")]
    UnexpectedComponents { url: String },

    /// The URL path cannot be converted into an object path (e.g. it contains `..` segments).
    #[error("invalid object path in {url}")]
    InvalidObjectPath {
        url: String,
        #[source]
        source: object_store::path::Error,
    },

    /// Filesystem path does not exist or cannot be accessed
    ///
    /// The path must be created (e.g., via `std::fs::create_dir_all()`) before attempting
    /// to create a storage URL from it.
    #[error("invalid filesystem path: {path}")]
    InvalidFilesystemPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_supported_storage_providers() {
        //* Given
        let file_scheme = "file";
        let s3_scheme = "s3";
        let s3a_scheme = "S3A";

        //* When
        let file_result = file_scheme
            .parse::<StorageProvider>()
            .expect("Failed to parse file scheme");
        let s3_result = s3_scheme
            .parse::<StorageProvider>()
            .expect("Failed to parse s3 scheme");
        let s3a_result = s3a_scheme
            .parse::<StorageProvider>()
            .expect("Failed to parse s3a scheme");

        //* Then
        assert_eq!(file_result, StorageProvider::Local);
        assert_eq!(s3_result, StorageProvider::AmazonS3);
        assert_eq!(s3a_result, StorageProvider::AmazonS3);
    }

    #[test]
    fn parse_unsupported_storage_schemes() {
        for scheme in ["http", "https", "gs", "memory"] {
            //* When
            let result = scheme
                .parse::<StorageProvider>()
                .expect_err("Expected unsupported scheme to fail");

            //* Then
            assert!(
                matches!(result, InvalidPathError::UnsupportedScheme { .. }),
                "scheme {scheme} should be rejected"
            );
        }
    }

    #[test]
    fn create_storage_url_from_s3_url() {
        //* Given
        let s3_url = "s3://my-bucket/path/to/table/";

        //* When
        let url = StorageUrl::new(s3_url).expect("Failed to create StorageUrl from S3 URL");

        //* Then
        assert_eq!(url.provider(), StorageProvider::AmazonS3);
        assert_eq!(url.bucket(), Some("my-bucket"));
        assert_eq!(
            url.object_path().expect("Failed to get object path").as_ref(),
            "path/to/table"
        );
    }

    #[test]
    fn s3_url_without_bucket_is_rejected() {
        //* When
        let result = StorageUrl::new("s3:///path").expect_err("Expected missing bucket to fail");

        //* Then
        assert!(matches!(
            result,
            InvalidPathError::MissingBucket { .. } | InvalidPathError::UrlParseError(_)
        ));
    }

    #[test]
    fn empty_location_is_rejected() {
        //* When
        let result = StorageUrl::new("  ").expect_err("Expected empty location to fail");

        //* Then
        assert!(matches!(result, InvalidPathError::Empty));
    }

    #[test]
    fn url_with_query_is_rejected() {
        //* When
        let result = "s3://bucket/prefix?versionId=1"
            .parse::<StorageUrl>()
            .expect_err("Expected query string to fail");

        //* Then
        assert!(matches!(
            result,
            InvalidPathError::UnexpectedComponents { .. }
        ));
    }

    #[test]
    fn as_prefix_appends_trailing_slash_once() {
        //* Given
        let url: StorageUrl = "s3://bucket/a/b".parse().expect("Failed to parse url");

        //* When
        let prefix = url.as_prefix();
        let again = prefix.as_prefix();

        //* Then
        assert_eq!(prefix.as_str(), "s3://bucket/a/b/");
        assert_eq!(again, prefix);
    }

    #[test]
    fn with_object_path_stays_in_bucket() {
        //* Given
        let url: StorageUrl = "s3://bucket/a/".parse().expect("Failed to parse url");

        //* When
        let child = url.with_object_path(&Path::from("a/x=1/part-00000.parquet"));

        //* Then
        assert_eq!(child.as_str(), "s3://bucket/a/x=1/part-00000.parquet");
    }

    #[test]
    fn create_storage_url_from_absolute_path() {
        //* Given
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let absolute_path = temp_dir
            .path()
            .to_str()
            .expect("Failed to convert path to string");

        //* When
        let url =
            StorageUrl::new(absolute_path).expect("Failed to create StorageUrl from absolute path");

        //* Then
        assert_eq!(url.provider(), StorageProvider::Local);
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with('/'));
        assert_eq!(url.bucket(), None);
    }

    #[test]
    fn create_storage_url_from_relative_path_with_base() {
        //* Given
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        std::fs::create_dir(temp_dir.path().join("staging"))
            .expect("Failed to create subdirectory");

        //* When
        let url = StorageUrl::new_with_base("staging", Some(temp_dir.path()))
            .expect("Failed to create StorageUrl from relative path");

        //* Then
        assert_eq!(url.provider(), StorageProvider::Local);
        assert!(url.path().contains("staging"));
    }

    #[test]
    fn create_storage_url_from_nonexistent_path_fails() {
        //* When
        let result = StorageUrl::new("/this/path/does/not/exist/hopefully")
            .expect_err("Expected nonexistent path to fail");

        //* Then
        assert!(matches!(
            result,
            InvalidPathError::InvalidFilesystemPath { .. }
        ));
    }
}
