//! SQL rendering for bulk transfers.

use lakeshift_codec::{CsvCompression, FileFormat};
use lakeshift_table::{ColumnDef, ColumnType};

/// Separator between the statements of a script.
pub const SCRIPT_SEPARATOR: &str = ";\n";

/// A schema-qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WarehouseTable {
    pub schema: String,
    pub table: String,
}

impl WarehouseTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// A table in the same schema with `suffix` appended to the name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.schema.clone(), format!("{}{suffix}", self.table))
    }
}

impl std::fmt::Display for WarehouseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", quote_identifier(&self.schema), quote_identifier(&self.table))
    }
}

/// How an upsert treats incoming rows whose keys already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertMode {
    /// Existing rows are deleted and replaced by the incoming ones.
    #[default]
    Replace,
    /// Incoming rows with existing keys are dropped.
    Skip,
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Warehouse type of a column.
pub fn column_type_name(ty: ColumnType, varchar_length: u32) -> String {
    match ty {
        ColumnType::Utf8 => format!("VARCHAR({varchar_length})"),
        ColumnType::Int8 | ColumnType::Int16 => "SMALLINT".to_string(),
        ColumnType::Int32 => "INTEGER".to_string(),
        ColumnType::Int64 => "BIGINT".to_string(),
        ColumnType::Float32 => "REAL".to_string(),
        ColumnType::Float64 => "DOUBLE PRECISION".to_string(),
        ColumnType::Boolean => "BOOLEAN".to_string(),
        ColumnType::Timestamp { utc: false } => "TIMESTAMP".to_string(),
        ColumnType::Timestamp { utc: true } => "TIMESTAMPTZ".to_string(),
        ColumnType::Date => "DATE".to_string(),
        ColumnType::Binary => "VARBYTE".to_string(),
        ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
    }
}

pub fn create_table(table: &WarehouseTable, columns: &[ColumnDef], varchar_length: u32) -> String {
    let columns = columns
        .iter()
        .map(|def| {
            format!(
                "{} {}",
                quote_identifier(&def.name),
                column_type_name(def.ty, varchar_length)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({columns})")
}

pub fn create_table_like(table: &WarehouseTable, like: &WarehouseTable) -> String {
    format!("CREATE TABLE {table} (LIKE {like})")
}

pub fn drop_table(table: &WarehouseTable) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

/// Bulk load of the objects under `prefix` into `table`.
///
/// Parquet objects map to table columns by position, so `columns` (when given) must list the
/// table columns in file column order.
pub fn copy(
    table: &WarehouseTable,
    columns: Option<&[String]>,
    prefix: &str,
    format: &FileFormat,
    iam_role: &str,
) -> String {
    let columns = columns
        .map(|columns| {
            let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
            format!(" ({})", names.join(", "))
        })
        .unwrap_or_default();
    let format = match format {
        FileFormat::Parquet(_) => "FORMAT AS PARQUET".to_string(),
        FileFormat::Csv(csv) => {
            let mut clause = format!(
                "FORMAT AS CSV DELIMITER AS {}",
                quote_literal(&char::from(csv.delimiter).to_string())
            );
            if csv.header {
                clause.push_str(" IGNOREHEADER 1");
            }
            if csv.compression == CsvCompression::Gzip {
                clause.push_str(" GZIP");
            }
            clause
        }
    };
    format!(
        "COPY {table}{columns} FROM {} IAM_ROLE {} {format}",
        quote_literal(prefix),
        quote_literal(iam_role)
    )
}

/// Export of the result of `sql` as Parquet objects under `prefix`.
pub fn unload(sql: &str, prefix: &str, iam_role: &str) -> String {
    let sql = sql.trim().trim_end_matches(';');
    format!(
        "UNLOAD ({}) TO {} IAM_ROLE {} FORMAT AS PARQUET",
        quote_literal(sql),
        quote_literal(prefix),
        quote_literal(iam_role)
    )
}

/// Joins statements into a script run as one transaction.
pub fn transaction(statements: Vec<String>) -> String {
    let mut script = Vec::with_capacity(statements.len() + 2);
    script.push("BEGIN TRANSACTION".to_string());
    script.extend(statements);
    script.push("END TRANSACTION".to_string());
    script.join(SCRIPT_SEPARATOR)
}

/// Merges `staging` into `target` on `keys`, then drops `staging`, as one transaction.
pub fn merge(
    target: &WarehouseTable,
    staging: &WarehouseTable,
    keys: &[String],
    mode: UpsertMode,
) -> String {
    let on = keys
        .iter()
        .map(|key| {
            let key = quote_identifier(key);
            format!("{target}.{key} = {staging}.{key}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let merge = match mode {
        UpsertMode::Replace => vec![
            format!("DELETE FROM {target} USING {staging} WHERE {on}"),
            format!("INSERT INTO {target} SELECT * FROM {staging}"),
        ],
        UpsertMode::Skip => {
            let first_key = keys.first().map(|key| quote_identifier(key)).unwrap_or_default();
            vec![format!(
                "INSERT INTO {target} SELECT {staging}.* FROM {staging} \
                 LEFT JOIN {target} ON {on} WHERE {target}.{first_key} IS NULL"
            )]
        }
    };
    let mut statements = merge;
    statements.push(drop_table(staging));
    transaction(statements)
}
