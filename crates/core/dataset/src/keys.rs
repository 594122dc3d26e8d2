//! Object key planning.
//!
//! Keys have the form `<base>/<col>=<escaped value>/…/part-<chunk:05>-<run_id><ext>`. The run id
//! is unique per write job, so concurrent jobs writing the same table or partition never
//! produce the same key, and every key of a partition shares the partition's prefix.

use lakeshift_object_store::{InvalidPathError, StorageUrl};
use lakeshift_table::PartitionValues;
use object_store::path::Path;
use uuid::Uuid;

/// Identifier of one write job, embedded in the name of every object the job writes.
///
/// Run ids are time-ordered (UUIDv7), so object names of later jobs sort after earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Plans the object keys of one write job.
#[derive(Debug, Clone)]
pub struct KeyPlanner {
    base: StorageUrl,
    base_path: Path,
    run_id: RunId,
    extension: &'static str,
    file_name: Option<String>,
}

impl KeyPlanner {
    /// Creates a planner for objects under `base`.
    ///
    /// `extension` is appended to generated file names, e.g. `.snappy.parquet`.
    pub fn new(
        base: &str,
        run_id: RunId,
        extension: &'static str,
    ) -> Result<Self, InvalidPathError> {
        let base = StorageUrl::new(base)?.as_prefix();
        let base_path = base.object_path()?;
        Ok(Self {
            base,
            base_path,
            run_id,
            extension,
            file_name: None,
        })
    }

    /// Pins the name of the single object the job writes.
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// The base location, in prefix form.
    pub fn base(&self) -> &StorageUrl {
        &self.base
    }

    /// The object path of the base location, relative to the bucket root.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The file name of chunk `chunk_index` of a partition.
    pub fn file_name(&self, chunk_index: usize) -> String {
        match &self.file_name {
            Some(name) => name.clone(),
            None => format!("part-{chunk_index:05}-{}{}", self.run_id, self.extension),
        }
    }

    /// The object path of a partition prefix. For the synthetic partition of an unpartitioned
    /// write this is the base path.
    pub fn partition_path(&self, values: &PartitionValues) -> Result<Path, InvalidPathError> {
        self.join(values.path_segments())
    }

    /// The storage URL of a partition prefix, with a trailing slash.
    pub fn partition_url(&self, values: &PartitionValues) -> Result<String, InvalidPathError> {
        let path = self.partition_path(values)?;
        Ok(self.url_of(&path).as_prefix().to_string())
    }

    /// The object path of chunk `chunk_index` of a partition.
    pub fn key(
        &self,
        values: &PartitionValues,
        chunk_index: usize,
    ) -> Result<Path, InvalidPathError> {
        let mut segments = values.path_segments();
        segments.push(self.file_name(chunk_index));
        self.join(segments)
    }

    /// The storage URL of an object path in the same bucket.
    pub fn url_of(&self, path: &Path) -> StorageUrl {
        self.base.with_object_path(path)
    }

    fn join(&self, segments: Vec<String>) -> Result<Path, InvalidPathError> {
        let mut raw = self.base_path.to_string();
        for segment in segments {
            if !raw.is_empty() {
                raw.push('/');
            }
            raw.push_str(&segment);
        }
        // Segments are already escaped, parsing keeps them verbatim
        Path::parse(&raw).map_err(|source| InvalidPathError::InvalidObjectPath {
            url: format!("{}{}", self.base, raw),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use lakeshift_table::Value;

    use super::*;

    fn run_id() -> RunId {
        RunId::from(Uuid::from_u128(0x0190_0000_0000_7000_8000_0000_0000_00c1))
    }

    #[test]
    fn key_embeds_partition_prefix_chunk_and_run_id() {
        //* Given
        let planner = KeyPlanner::new("s3://bucket/sales", run_id(), ".snappy.parquet")
            .expect("Failed to create planner");
        let values = PartitionValues::new(vec![("region".into(), Value::from("eu"))]);

        //* When
        let key = planner.key(&values, 3).expect("Failed to plan key");

        //* Then
        assert_eq!(
            key.as_ref(),
            "sales/region=eu/part-00003-019000000000700080000000000000c1.snappy.parquet"
        );
        assert_eq!(
            planner.url_of(&key).as_str(),
            "s3://bucket/sales/region=eu/part-00003-019000000000700080000000000000c1.snappy.parquet"
        );
        assert_eq!(
            planner.partition_url(&values).expect("Failed to plan prefix"),
            "s3://bucket/sales/region=eu/"
        );
    }

    #[test]
    fn key_keeps_escaped_values_verbatim() {
        //* Given
        let planner =
            KeyPlanner::new("s3://bucket/t/", run_id(), ".csv").expect("Failed to create planner");
        let values = PartitionValues::new(vec![
            ("path".into(), Value::from("a/b=c")),
            ("day".into(), Value::Null),
        ]);

        //* When
        let key = planner.key(&values, 0).expect("Failed to plan key");

        //* Then
        assert!(key.as_ref().starts_with(
            "t/path=a%2Fb%3Dc/day=__HIVE_DEFAULT_PARTITION__/part-00000-"
        ));
    }

    #[test]
    fn unpartitioned_keys_live_under_base() {
        let planner = KeyPlanner::new("s3://bucket/t", run_id(), ".parquet")
            .expect("Failed to create planner");
        let values = PartitionValues::default();

        assert_eq!(
            planner.partition_path(&values).expect("Failed to plan prefix").as_ref(),
            "t"
        );
        assert!(
            planner
                .key(&values, 0)
                .expect("Failed to plan key")
                .as_ref()
                .starts_with("t/part-00000-")
        );
    }

    #[test]
    fn pinned_file_name_replaces_generated_name() {
        let planner = KeyPlanner::new("s3://bucket/exports", run_id(), ".csv")
            .expect("Failed to create planner")
            .with_file_name("orders.csv");

        let key = planner.key(&PartitionValues::default(), 0).expect("Failed to plan key");

        assert_eq!(key.as_ref(), "exports/orders.csv");
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn new_rejects_invalid_base() {
        let result = KeyPlanner::new("gs://bucket/t", run_id(), ".parquet");
        assert!(matches!(result, Err(InvalidPathError::UnsupportedScheme { .. })));
    }
}
