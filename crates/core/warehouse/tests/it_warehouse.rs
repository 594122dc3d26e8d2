use std::sync::Arc;

use lakeshift_codec::{DecodeOptions, FileFormat, ReadFormat};
use lakeshift_dataset::{DatasetWriter, WriteOptions};
use lakeshift_object_store::{ObjectStoreClient, StorageClient};
use lakeshift_table::{ChunkTarget, ColumnDef, ColumnType};
use lakeshift_warehouse::{
    LoadMode, LoadOptions, StatementError, UpsertMode, WarehouseConfig, WarehouseDriver,
    WarehouseError, WarehouseTable,
};
use object_store::path::Path;

mod common;

use common::FakeWarehouse;

const TARGET: &str = "\"public\".\"sales\"";

fn target() -> WarehouseTable {
    WarehouseTable::new("public", "sales")
}

/// A driver and warehouse sharing one in-memory store.
fn setup(
    configure: impl FnOnce(FakeWarehouse) -> FakeWarehouse,
    config: WarehouseConfig,
) -> (WarehouseDriver, Arc<FakeWarehouse>, Arc<ObjectStoreClient>) {
    let client = common::store();
    let executor = common::executor(client.clone());
    let warehouse = Arc::new(configure(FakeWarehouse::new(executor.clone())));
    let driver = WarehouseDriver::new(warehouse.clone(), executor, config);
    (driver, warehouse, client)
}

async fn staged_objects(client: &ObjectStoreClient) -> usize {
    client
        .list(&Path::from("staging"))
        .await
        .expect("Failed to list staging")
        .len()
}

#[tokio::test]
async fn copy_loads_the_rows_of_every_staged_file() {
    //* Given
    let (driver, warehouse, client) = setup(|warehouse| warehouse, common::config());
    let writer = DatasetWriter::new(common::executor(client.clone()));
    let options = WriteOptions {
        partition_columns: vec!["region".to_string()],
        chunk_target: ChunkTarget::Files(2),
        ..Default::default()
    };
    writer
        .write(&common::sales(), "s3://bucket/exports/sales", &options)
        .await
        .expect("Failed to stage files");
    let files = client
        .list(&Path::from("exports/sales"))
        .await
        .expect("Failed to list staged files");
    let mut file_rows = 0;
    for file in &files {
        let bytes = client.get(&file.location).await.expect("Failed to get file");
        let table = ReadFormat::Parquet
            .decode(file.location.as_ref(), bytes, &DecodeOptions::default())
            .expect("Failed to decode file");
        file_rows += table.num_rows() as u64;
    }
    driver
        .execute(&format!("CREATE TABLE IF NOT EXISTS {TARGET} (\"id\" BIGINT)"))
        .await
        .expect("Failed to create table");

    //* When
    let loaded = driver
        .copy(&target(), "s3://bucket/exports/sales", &FileFormat::default())
        .await
        .expect("Failed to copy");

    //* Then
    assert_eq!(files.len(), 4);
    assert_eq!(loaded, file_rows);
    assert_eq!(loaded, 10);
    assert_eq!(warehouse.rows_of(TARGET), Some(10));
    let submitted = warehouse.submitted.lock().clone();
    assert_eq!(
        submitted[1],
        format!(
            "COPY {TARGET} FROM 's3://bucket/exports/sales/' IAM_ROLE '{}' FORMAT AS PARQUET",
            common::IAM_ROLE
        )
    );
}

#[tokio::test]
async fn append_load_creates_table_and_adds_rows() {
    //* Given
    let (driver, warehouse, client) = setup(|warehouse| warehouse, common::config());
    let options = LoadOptions::default();

    //* When
    let first = driver
        .load(&common::sales(), &target(), &options)
        .await
        .expect("Failed to load");
    let second = driver
        .load(&common::sales(), &target(), &options)
        .await
        .expect("Failed to load again");

    //* Then
    assert_eq!(first.rows_loaded, 10);
    assert_eq!(second.rows_loaded, 10);
    assert_ne!(first.staged_location, second.staged_location);
    assert!(first.staged_location.starts_with("s3://bucket/staging/"));
    assert_eq!(warehouse.rows_of(TARGET), Some(20));

    let submitted = warehouse.submitted.lock().clone();
    assert_eq!(
        submitted[0],
        format!(
            "CREATE TABLE IF NOT EXISTS {TARGET} \
             (\"id\" BIGINT, \"item\" VARCHAR(256), \"region\" VARCHAR(256))"
        )
    );
    assert_eq!(
        submitted[1],
        format!(
            "COPY {TARGET} (\"id\", \"item\", \"region\") FROM '{}' IAM_ROLE '{}' \
             FORMAT AS PARQUET",
            first.staged_location,
            common::IAM_ROLE
        )
    );
    assert_eq!(staged_objects(&client).await, 0);
}

#[tokio::test]
async fn overwrite_load_replaces_rows_in_one_transaction() {
    //* Given
    let (driver, warehouse, _) = setup(|warehouse| warehouse, common::config());
    let options = LoadOptions {
        mode: LoadMode::Overwrite,
        ..Default::default()
    };

    //* When
    for _ in 0..2 {
        driver
            .load(&common::sales(), &target(), &options)
            .await
            .expect("Failed to load");
    }

    //* Then
    assert_eq!(warehouse.rows_of(TARGET), Some(10));
    let submitted = warehouse.submitted.lock().clone();
    let last: Vec<&str> = submitted
        .last()
        .expect("a statement was submitted")
        .split(";\n")
        .collect();
    assert_eq!(last.len(), 4);
    assert_eq!(last[0], "BEGIN TRANSACTION");
    assert_eq!(last[1], format!("DELETE FROM {TARGET}"));
    assert!(last[2].starts_with(&format!("COPY {TARGET} ")));
    assert_eq!(last[3], "END TRANSACTION");
}

#[tokio::test]
async fn upsert_copies_into_merge_table_then_merges() {
    //* Given
    let (driver, warehouse, _) = setup(|warehouse| warehouse, common::config());
    let options = LoadOptions {
        mode: LoadMode::Upsert {
            keys: vec!["id".to_string()],
            mode: UpsertMode::Replace,
        },
        ..Default::default()
    };

    //* When
    let report = driver
        .load(&common::sales(), &target(), &options)
        .await
        .expect("Failed to upsert");

    //* Then
    assert_eq!(report.rows_loaded, 10);
    assert_eq!(warehouse.rows_of(TARGET), Some(10));
    let submitted = warehouse.submitted.lock().clone();
    assert_eq!(submitted.len(), 4);
    assert!(submitted[0].starts_with(&format!("CREATE TABLE IF NOT EXISTS {TARGET} (")));
    assert!(submitted[1].starts_with("CREATE TABLE \"public\".\"sales_stage_"));
    assert!(submitted[1].ends_with(&format!(" (LIKE {TARGET})")));
    assert!(submitted[2].starts_with("COPY \"public\".\"sales_stage_"));
    let merge: Vec<&str> = submitted[3].split(";\n").collect();
    assert_eq!(merge[0], "BEGIN TRANSACTION");
    assert!(merge[1].starts_with(&format!("DELETE FROM {TARGET} USING ")));
    assert!(merge[2].starts_with(&format!("INSERT INTO {TARGET} SELECT * FROM ")));
    assert!(merge[3].starts_with("DROP TABLE IF EXISTS \"public\".\"sales_stage_"));
    assert_eq!(merge[4], "END TRANSACTION");
    assert!(
        warehouse
            .tables
            .lock()
            .keys()
            .all(|name| !name.contains("sales_stage_")),
        "merge table should be dropped"
    );
}

#[tokio::test]
async fn upsert_key_must_be_a_table_column() {
    let (driver, warehouse, _) = setup(|warehouse| warehouse, common::config());
    let options = LoadOptions {
        mode: LoadMode::Upsert {
            keys: vec!["order_id".to_string()],
            mode: UpsertMode::Skip,
        },
        ..Default::default()
    };

    let result = driver.load(&common::sales(), &target(), &options).await;

    assert!(matches!(result, Err(WarehouseError::UnknownUpsertKey(key)) if key == "order_id"));
    assert!(warehouse.submitted.lock().is_empty());
}

#[tokio::test]
async fn failed_copy_reports_and_keeps_staged_objects() {
    //* Given
    let reason = "S3ServiceException: Access Denied, Status 403";
    let (driver, warehouse, client) = setup(
        |warehouse| warehouse.failing_on("COPY ", reason),
        common::config(),
    );
    let options = LoadOptions {
        chunk_target: ChunkTarget::Rows(4),
        ..Default::default()
    };

    //* When
    let result = driver.load(&common::sales(), &target(), &options).await;

    //* Then
    let err = match result {
        Err(err) => err,
        Ok(report) => panic!("expected the load to fail, got {report:?}"),
    };
    assert_eq!(err.staged_objects().len(), 3);
    match &err {
        WarehouseError::Load {
            source: StatementError::Failed { reason: actual, .. },
            ..
        } => assert_eq!(actual, reason),
        other => panic!("expected a failed load statement, got {other:?}"),
    }
    assert_eq!(staged_objects(&client).await, 3);
    assert_eq!(warehouse.rows_of(TARGET), Some(0));
}

#[tokio::test]
async fn unload_reads_result_back_and_removes_staged_objects() {
    //* Given
    let sql = "SELECT * FROM sales WHERE region = 'eu'";
    let (driver, warehouse, client) = setup(
        |warehouse| warehouse.with_result(sql, common::sales()),
        common::config(),
    );

    //* When
    let table = driver.unload(sql).await.expect("Failed to unload");

    //* Then
    assert_eq!(table.num_rows(), 10);
    assert_eq!(
        table.column_defs(),
        vec![
            ColumnDef::new("id", ColumnType::Int64),
            ColumnDef::new("item", ColumnType::Utf8),
            ColumnDef::new("region", ColumnType::Utf8),
        ]
    );
    assert!(table.rows().eq(common::sales().rows()));
    let submitted = warehouse.submitted.lock().clone();
    assert!(submitted[0].starts_with(
        "UNLOAD ('SELECT * FROM sales WHERE region = ''eu''') TO 's3://bucket/staging/"
    ));
    assert_eq!(staged_objects(&client).await, 0);
}

#[tokio::test]
async fn unload_without_rows_returns_table_without_columns() {
    let sql = "SELECT * FROM sales WHERE false";
    let (driver, _, _) = setup(
        |warehouse| warehouse.with_result(sql, common::sales().slice(0, 0)),
        common::config(),
    );

    let table = driver.unload(sql).await.expect("Failed to unload");

    assert_eq!(table.num_rows(), 0);
    assert_eq!(table.num_columns(), 0);
}

#[tokio::test]
async fn aborted_statement_is_reported() {
    let (driver, _, _) = setup(
        |warehouse| warehouse.aborting_on("VACUUM"),
        common::config(),
    );

    let result = driver.execute("VACUUM \"public\".\"sales\"").await;

    assert!(matches!(result, Err(StatementError::Aborted { .. })));
}

#[tokio::test]
async fn transfers_require_an_iam_role() {
    //* Given
    let (driver, warehouse, client) = setup(
        |warehouse| warehouse,
        WarehouseConfig {
            iam_role: None,
            ..common::config()
        },
    );

    //* When
    let result = driver
        .load(&common::sales(), &target(), &LoadOptions::default())
        .await;

    //* Then
    assert!(matches!(result, Err(WarehouseError::NoIamRole)));
    assert!(warehouse.submitted.lock().is_empty());
    assert_eq!(staged_objects(&client).await, 0);
}
