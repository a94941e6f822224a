//! Fixture configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use dockerdb_common::constants::MONGO_PORT;
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::VersionKey;
use dockerdb_service::kind::ServiceOptions;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How long a prepared instance is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Every acquisition is prepared from scratch.
    #[default]
    Function,
    /// Prepared once per version per fixture, then shared.
    Module,
    /// Prepared once per version per fixture, then shared.
    Session,
}

impl Scope {
    /// Returns `true` if a prepared instance is handed out again.
    #[must_use]
    pub const fn shares_preparation(self) -> bool {
        !matches!(self, Self::Function)
    }
}

/// Documents to insert, by database and collection.
///
/// Documents within a collection keep their order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeedData(BTreeMap<String, BTreeMap<String, Vec<Value>>>);

impl SeedData {
    /// Empty data set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends documents to `database.collection`.
    #[must_use]
    pub fn with(
        mut self,
        database: impl Into<String>,
        collection: impl Into<String>,
        documents: impl IntoIterator<Item = Value>,
    ) -> Self {
        self.0
            .entry(database.into())
            .or_default()
            .entry(collection.into())
            .or_default()
            .extend(documents);
        self
    }

    /// Iterates `(database, collection, documents)`.
    pub fn collections(&self) -> impl Iterator<Item = (&str, &str, &[Value])> {
        self.0.iter().flat_map(|(database, collections)| {
            collections
                .iter()
                .map(move |(collection, docs)| (database.as_str(), collection.as_str(), docs.as_slice()))
        })
    }

    /// Total number of documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.collections().map(|(_, _, docs)| docs.len()).sum()
    }

    /// Returns `true` if there is nothing to insert.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document_count() == 0
    }
}

/// Everything a fixture can be configured with.
///
/// Deserializes from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureOptions {
    /// Sharing of prepared instances.
    pub scope: Scope,
    /// Versions the fixture is parametrized over.
    pub versions: Vec<VersionKey>,
    /// Data inserted before every prepared hand-out.
    pub data: Option<SeedData>,
    /// Dump archive restored before every prepared hand-out.
    pub restore: Option<PathBuf>,
    /// Pool instances instead of creating one per acquisition.
    pub reuse: bool,
    /// Replica set to initiate.
    pub replica_set: Option<String>,
    /// Port the service listens on.
    pub port: u16,
    /// Opaque arguments handed to database clients.
    pub client_args: Map<String, Value>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            scope: Scope::Function,
            versions: vec![VersionKey::latest()],
            data: None,
            restore: None,
            reuse: true,
            replica_set: None,
            port: MONGO_PORT,
            client_args: Map::new(),
        }
    }
}

impl FixtureOptions {
    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON, or
    /// [`DockerDbError::Config`] if the options are inconsistent.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the scope.
    #[must_use]
    pub const fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the versions to parametrize over.
    #[must_use]
    pub fn versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<VersionKey>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the data to seed.
    #[must_use]
    pub fn data(mut self, data: SeedData) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the dump archive to restore.
    #[must_use]
    pub fn restore(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore = Some(path.into());
        self
    }

    /// Enables or disables pooling.
    #[must_use]
    pub const fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Sets the replica set name.
    #[must_use]
    pub fn replica_set(mut self, name: impl Into<String>) -> Self {
        self.replica_set = Some(name.into());
        self
    }

    /// Sets the service port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets one opaque client argument.
    #[must_use]
    pub fn client_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.client_args.insert(key.into(), value);
        self
    }

    /// Checks that the options can drive a fixture.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Config`] if no version is given.
    pub fn validate(&self) -> Result<()> {
        if self.versions.is_empty() {
            return Err(DockerDbError::Config {
                message: "fixture needs at least one version".into(),
            });
        }
        Ok(())
    }

    /// Options for creating the underlying instances.
    #[must_use]
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            port: Some(self.port),
            replica_set: self.replica_set.clone(),
            env: Vec::new(),
            client_args: self.client_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let options = FixtureOptions::default();
        assert_eq!(options.scope, Scope::Function);
        assert_eq!(options.versions, vec![VersionKey::latest()]);
        assert!(options.data.is_none());
        assert!(options.restore.is_none());
        assert!(options.reuse);
        assert!(options.replica_set.is_none());
        assert_eq!(options.port, 27017);
        assert!(options.client_args.is_empty());
    }

    #[test]
    fn json_fills_in_defaults() {
        let options = FixtureOptions::from_json(
            r#"{
                "scope": "module",
                "versions": ["5.0", "6.0"],
                "data": {"db1": {"users": [{"name": "a"}, {"name": "b"}]}},
                "reuse": false
            }"#,
        )
        .unwrap();
        assert_eq!(options.scope, Scope::Module);
        assert_eq!(options.versions, vec![VersionKey::new("5.0"), VersionKey::new("6.0")]);
        assert!(!options.reuse);
        assert_eq!(options.port, 27017);

        let data = options.data.unwrap();
        let (db, collection, docs) = data.collections().next().unwrap();
        assert_eq!((db, collection), ("db1", "users"));
        assert_eq!(docs, &[json!({"name": "a"}), json!({"name": "b"})]);
    }

    #[test]
    fn empty_versions_are_rejected() {
        let err = FixtureOptions::from_json(r#"{"versions": []}"#).unwrap_err();
        assert!(matches!(err, DockerDbError::Config { .. }));
    }

    #[test]
    fn unknown_scope_is_a_serialization_error() {
        let err = FixtureOptions::from_json(r#"{"scope": "class"}"#).unwrap_err();
        assert!(matches!(err, DockerDbError::Serialization { .. }));
    }

    #[test]
    fn seed_data_appends_in_order() {
        let data = SeedData::new()
            .with("db1", "users", [json!({"n": 1})])
            .with("db1", "users", [json!({"n": 2}), json!({"n": 3})])
            .with("db2", "events", []);
        assert_eq!(data.document_count(), 3);
        let users: Vec<_> = data.collections().collect();
        assert_eq!(users[0].2[2], json!({"n": 3}));
        assert!(!data.is_empty());
        assert!(SeedData::new().with("db", "c", []).is_empty());
    }

    #[test]
    fn service_options_carry_port_and_replica_set() {
        let options = FixtureOptions::default()
            .port(27018)
            .replica_set("rs0")
            .client_arg("w", json!(1));
        let service = options.service_options();
        assert_eq!(service.port, Some(27018));
        assert_eq!(service.replica_set.as_deref(), Some("rs0"));
        assert_eq!(service.client_args["w"], 1);
    }

    #[test]
    fn only_function_scope_reprepares() {
        assert!(!Scope::Function.shares_preparation());
        assert!(Scope::Module.shares_preparation());
        assert!(Scope::Session.shares_preparation());
    }
}
