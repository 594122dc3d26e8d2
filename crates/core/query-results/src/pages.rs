//! Paged reading of query results.

use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use futures::Stream;
use lakeshift_executor::RetryPolicy;
use lakeshift_table::{ColumnDef, ColumnType, Table};

use crate::{
    QueryError,
    service::{QueryId, QueryService, ResultColumn},
};

/// Largest page the query service returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Catalog type names of nested values, which the service renders as text.
const NESTED_TYPES: &[&str] = &["array", "map", "row", "struct", "json"];

#[derive(Debug)]
enum Cursor {
    First,
    Next(String),
    Done,
}

/// The result rows of a finished query, as a lazy, finite sequence of tables.
///
/// Each call to [`next_page`](Self::next_page) fetches one page of at most `page_size` rows and
/// converts it using the result column metadata. The sequence cannot be restarted: once it
/// returned `None` or an error, every further call returns `None`.
#[derive(Debug)]
pub struct ResultPages {
    service: Arc<dyn QueryService>,
    id: QueryId,
    page_size: usize,
    retry: RetryPolicy,
    cursor: Cursor,
    columns: Option<Vec<ColumnDef>>,
    pages_read: usize,
    rows_read: usize,
}

impl ResultPages {
    pub(crate) fn new(
        service: Arc<dyn QueryService>,
        id: QueryId,
        page_size: usize,
        retry: RetryPolicy,
    ) -> Result<Self, QueryError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(QueryError::InvalidPageSize(page_size));
        }
        Ok(Self {
            service,
            id,
            page_size,
            retry,
            cursor: Cursor::First,
            columns: None,
            pages_read: 0,
            rows_read: 0,
        })
    }

    pub fn query_id(&self) -> &QueryId {
        &self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Result columns, known once the first page was fetched.
    pub fn columns(&self) -> Option<&[ColumnDef]> {
        self.columns.as_deref()
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// Fetches and converts the next page.
    pub async fn next_page(&mut self) -> Option<Result<Table, QueryError>> {
        let token = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Done => return None,
            Cursor::First => None,
            Cursor::Next(token) => Some(token),
        };
        match self.fetch(token.as_deref()).await {
            Ok((table, next)) => {
                if let Some(next) = next {
                    self.cursor = Cursor::Next(next);
                } else {
                    tracing::debug!(
                        query_id = %self.id,
                        pages = self.pages_read,
                        rows = self.rows_read,
                        "read all result pages"
                    );
                }
                Some(Ok(table))
            }
            Err(err) => Some(Err(err)),
        }
    }

    async fn fetch(&mut self, token: Option<&str>) -> Result<(Table, Option<String>), QueryError> {
        let context = format!("results of query {}", self.id);
        let page = self
            .retry
            .run(&context, || {
                self.service
                    .get_query_results(&self.id, token, self.page_size)
            })
            .await
            .map_err(|source| QueryError::Results {
                id: self.id.clone(),
                source,
            })?;

        let defs = match &self.columns {
            Some(defs) => defs.clone(),
            None => {
                let defs = column_defs(&page.columns)?;
                self.columns = Some(defs.clone());
                defs
            }
        };
        let table = page_table(&defs, page.rows, &format!("{} page {}", self.id, self.pages_read))?;
        self.pages_read += 1;
        self.rows_read += table.num_rows();
        Ok((table, page.next_token))
    }

    /// Reads every remaining page into one table.
    pub async fn collect(mut self) -> Result<Table, QueryError> {
        let mut tables = Vec::new();
        while let Some(page) = self.next_page().await {
            tables.push(page?);
        }
        let columns = self.columns.unwrap_or_default();
        Ok(Table::concat(&tables)?.unwrap_or_else(|| Table::empty(&columns)))
    }

    /// Turns the remaining pages into a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Table, QueryError>> {
        futures::stream::unfold(self, |mut pages| async move {
            let page = pages.next_page().await?;
            Some((page, pages))
        })
    }
}

/// Resolves result column metadata into column declarations.
///
/// Nested values are read as text.
pub fn column_defs(columns: &[ResultColumn]) -> Result<Vec<ColumnDef>, QueryError> {
    columns
        .iter()
        .map(|column| {
            let normalized = column.type_name.trim().to_ascii_lowercase();
            let base = normalized
                .split(['(', '<'])
                .next()
                .unwrap_or_default()
                .trim();
            let ty = if NESTED_TYPES.contains(&base) {
                ColumnType::Utf8
            } else if base == "timestamp with time zone" {
                ColumnType::Timestamp { utc: true }
            } else {
                ColumnType::from_catalog_name(&column.type_name).map_err(|source| {
                    QueryError::UnsupportedType {
                        column: column.name.clone(),
                        source,
                    }
                })?
            };
            Ok(ColumnDef::new(column.name.clone(), ty))
        })
        .collect()
}

fn page_table(
    defs: &[ColumnDef],
    rows: Vec<Vec<Option<String>>>,
    chunk: &str,
) -> Result<Table, QueryError> {
    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(rows.len()); defs.len()];
    for row in rows {
        if row.len() != defs.len() {
            return Err(QueryError::RowWidth {
                page: chunk.to_string(),
                expected: defs.len(),
                actual: row.len(),
            });
        }
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value);
        }
    }
    let num_rows = columns.first().map_or(0, Vec::len);
    let text_columns: Vec<(String, ArrayRef)> = defs
        .iter()
        .zip(columns)
        .map(|(def, values)| (def.name.clone(), Arc::new(StringArray::from(values)) as ArrayRef))
        .collect();
    let text = if text_columns.is_empty() {
        Table::nulls(&[], num_rows)?
    } else {
        Table::from_columns(text_columns)?
    };
    Ok(text.cast_to(defs, Some(chunk))?)
}
