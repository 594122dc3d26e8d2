//! In-memory catalog (not persistent)

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{CatalogError, CatalogPartition, CatalogService, CatalogTable, TableRef};

#[derive(Debug, Clone)]
struct Entry {
    table: CatalogTable,
    partitions: BTreeMap<Vec<String>, CatalogPartition>,
}

/// [`CatalogService`] keeping every entry in process memory.
///
/// Suitable for tests and single-process pipelines; entries are lost when the process exits.
/// Partitions are listed in ascending order of their values.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<BTreeMap<TableRef, Entry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every registered table, in ascending order.
    pub fn tables(&self) -> Vec<TableRef> {
        self.entries.read().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl CatalogService for InMemoryCatalog {
    async fn get_table(&self, table: &TableRef) -> Result<Option<CatalogTable>, CatalogError> {
        Ok(self.entries.read().get(table).map(|entry| entry.table.clone()))
    }

    async fn get_partitions(
        &self,
        table: &TableRef,
    ) -> Result<Vec<CatalogPartition>, CatalogError> {
        let entries = self.entries.read();
        let entry = entries
            .get(table)
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))?;
        Ok(entry.partitions.values().cloned().collect())
    }

    async fn create_table(&self, table: CatalogTable) -> Result<(), CatalogError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&table.name) {
            return Err(CatalogError::TableAlreadyExists(table.name));
        }
        entries.insert(
            table.name.clone(),
            Entry {
                table,
                partitions: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn update_table(&self, table: CatalogTable) -> Result<(), CatalogError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&table.name)
            .ok_or_else(|| CatalogError::TableNotFound(table.name.clone()))?;
        entry.table = table;
        Ok(())
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), CatalogError> {
        self.entries
            .write()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))
    }

    async fn batch_create_partitions(
        &self,
        table: &TableRef,
        partitions: Vec<CatalogPartition>,
    ) -> Result<(), CatalogError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(table)
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))?;

        let expected = entry.table.partition_keys.len();
        if let Some(invalid) = partitions.iter().find(|p| p.values.len() != expected) {
            return Err(CatalogError::InvalidPartition {
                table: table.clone(),
                values: invalid.values.clone(),
                expected,
            });
        }
        for partition in partitions {
            entry.partitions.insert(partition.values.clone(), partition);
        }
        Ok(())
    }

    async fn batch_delete_partitions(
        &self,
        table: &TableRef,
        values: Vec<Vec<String>>,
    ) -> Result<(), CatalogError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(table)
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))?;
        for values in values {
            entry.partitions.remove(&values);
        }
        Ok(())
    }
}
