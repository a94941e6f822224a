//! Inserting seed documents into an instance.

use std::fmt;

use dockerdb_common::error::Result;
use dockerdb_service::instance::Instance;
use serde_json::Value;

use crate::options::SeedData;

/// Inserts documents into one collection of a running instance.
pub trait Seeder: Send + Sync + fmt::Debug {
    /// Appends `documents`, in order, to `database.collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the documents could not be inserted.
    fn insert(
        &self,
        instance: &Instance,
        database: &str,
        collection: &str,
        documents: &[Value],
    ) -> Result<()>;
}

/// Seeds through `mongoimport` inside the container, with the documents
/// streamed as a JSON array on stdin and inserted in array order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoImportSeeder;

impl MongoImportSeeder {
    fn command(port: u16, database: &str, collection: &str) -> Vec<String> {
        vec![
            "mongoimport".into(),
            "--quiet".into(),
            "--port".into(),
            port.to_string(),
            "--db".into(),
            database.into(),
            "--collection".into(),
            collection.into(),
            "--jsonArray".into(),
            "--maintainInsertionOrder".into(),
        ]
    }
}

impl Seeder for MongoImportSeeder {
    fn insert(
        &self,
        instance: &Instance,
        database: &str,
        collection: &str,
        documents: &[Value],
    ) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(documents)?;
        let command = Self::command(instance.port(), database, collection);
        let _ = instance.exec_checked(&command, &mut payload.as_slice())?;
        tracing::debug!(
            name = %instance.name(),
            database,
            collection,
            count = documents.len(),
            "inserted documents"
        );
        Ok(())
    }
}

/// Inserts every collection of `data`.
///
/// # Errors
///
/// Stops at the first collection that fails to insert.
pub fn seed(instance: &Instance, data: &SeedData, seeder: &dyn Seeder) -> Result<()> {
    for (database, collection, documents) in data.collections() {
        seeder.insert(instance, database, collection, documents)?;
    }
    tracing::info!(name = %instance.name(), documents = data.document_count(), "seeded instance");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_reads_a_json_array_from_stdin() {
        let command = MongoImportSeeder::command(27017, "db1", "users");
        assert_eq!(
            command,
            vec![
                "mongoimport",
                "--quiet",
                "--port",
                "27017",
                "--db",
                "db1",
                "--collection",
                "users",
                "--jsonArray",
                "--maintainInsertionOrder"
            ]
        );
    }
}
