//! Service families that can be provisioned.

use std::fmt;

use dockerdb_common::constants::{HTTP_PORT, MONGO_PORT};
use dockerdb_common::error::Result;
use dockerdb_common::types::VersionKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::instance::Instance;
use crate::probe::{ExecProbe, HttpProbe, ReadinessProbe};

/// Databases a Mongo reset leaves in place.
const MONGO_SYSTEM_DATABASES: [&str; 3] = ["admin", "config", "local"];

/// Per-instance settings shared by all service kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Port the service listens on; the kind's default when `None`.
    pub port: Option<u16>,
    /// Replica set to initiate, for kinds that support one.
    pub replica_set: Option<String>,
    /// Extra environment variables for the container.
    pub env: Vec<(String, String)>,
    /// Opaque arguments handed to database clients.
    pub client_args: Map<String, Value>,
}

/// A family of containerized services.
pub trait ServiceKind: Send + Sync + fmt::Debug {
    /// Short name used in container names and labels.
    fn name(&self) -> &str;

    /// Image reference for a version.
    fn image(&self, version: &VersionKey) -> String;

    /// Port the service listens on unless overridden.
    fn port(&self) -> u16;

    /// Arguments passed to the image entrypoint.
    fn command(&self, _options: &ServiceOptions) -> Vec<String> {
        Vec::new()
    }

    /// Client connection string for a reachable address.
    fn connection_uri(&self, address: &str, port: u16) -> String;

    /// Readiness check for an instance listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be constructed.
    fn probe(&self, port: u16) -> Result<Box<dyn ReadinessProbe>>;

    /// Restores a clean baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance could not be reset.
    fn reset(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }

    /// One-time initialization run after the first successful readiness
    /// check.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    fn after_ready(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }
}

/// MongoDB from the official `mongo` image.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mongo;

impl Mongo {
    /// `mongosh` invocation evaluating `script` against the local server.
    #[must_use]
    pub fn shell(port: u16, script: &str) -> Vec<String> {
        vec![
            "mongosh".into(),
            "--quiet".into(),
            "--port".into(),
            port.to_string(),
            "--eval".into(),
            script.into(),
        ]
    }

    fn reset_script() -> String {
        let keep = MONGO_SYSTEM_DATABASES
            .iter()
            .map(|db| format!("'{db}'"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "db.getMongo().getDBNames()\
             .filter(name => ![{keep}].includes(name))\
             .forEach(name => db.getSiblingDB(name).dropDatabase())"
        )
    }

    fn initiate_script(replica_set: &str, host: &str) -> String {
        format!(
            "try {{ rs.status() }} catch (e) {{ \
             rs.initiate({{_id: '{replica_set}', members: [{{_id: 0, host: '{host}'}}]}}) }}; \
             while (!db.hello().isWritablePrimary) {{ sleep(100) }}"
        )
    }
}

impl ServiceKind for Mongo {
    fn name(&self) -> &str {
        "mongo"
    }

    fn image(&self, version: &VersionKey) -> String {
        format!("mongo:{version}")
    }

    fn port(&self) -> u16 {
        MONGO_PORT
    }

    fn command(&self, options: &ServiceOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = options.port.filter(|p| *p != MONGO_PORT) {
            args.extend(["--port".to_string(), port.to_string()]);
        }
        if let Some(replica_set) = &options.replica_set {
            args.extend(["--replSet".to_string(), replica_set.clone()]);
        }
        args
    }

    fn connection_uri(&self, address: &str, port: u16) -> String {
        format!("mongodb://{address}:{port}/")
    }

    fn probe(&self, port: u16) -> Result<Box<dyn ReadinessProbe>> {
        Ok(Box::new(ExecProbe::new(Self::shell(
            port,
            "db.runCommand({ping:1})",
        ))))
    }

    fn reset(&self, instance: &Instance) -> Result<()> {
        let _ = instance.exec_checked(
            &Self::shell(instance.port(), &Self::reset_script()),
            &mut std::io::empty(),
        )?;
        tracing::debug!(name = %instance.name(), "dropped user databases");
        Ok(())
    }

    fn after_ready(&self, instance: &Instance) -> Result<()> {
        let Some(replica_set) = &instance.options().replica_set else {
            return Ok(());
        };
        let host = format!("{}:{}", instance.network_address()?, instance.port());
        let script = Self::initiate_script(replica_set, &host);
        let _ = instance.exec_checked(&Self::shell(instance.port(), &script), &mut std::io::empty())?;
        tracing::info!(name = %instance.name(), replica_set = %replica_set, "replica set initiated");
        Ok(())
    }
}

/// A plain HTTP service from an arbitrary image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServer {
    image: String,
    path: String,
}

impl HttpServer {
    /// Service from `image` (without tag), probed at `/`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            path: "/".into(),
        }
    }

    /// Probes `path` instead of the root.
    #[must_use]
    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

impl ServiceKind for HttpServer {
    fn name(&self) -> &str {
        "http"
    }

    fn image(&self, version: &VersionKey) -> String {
        format!("{}:{version}", self.image)
    }

    fn port(&self) -> u16 {
        HTTP_PORT
    }

    fn connection_uri(&self, address: &str, port: u16) -> String {
        format!("http://{address}:{port}")
    }

    fn probe(&self, port: u16) -> Result<Box<dyn ReadinessProbe>> {
        Ok(Box::new(HttpProbe::new(port)?.with_path(self.path.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mongo_default_command_is_empty() {
        assert!(Mongo.command(&ServiceOptions::default()).is_empty());
        assert_eq!(Mongo.image(&VersionKey::new("6.0")), "mongo:6.0");
    }

    #[test]
    fn mongo_command_carries_port_and_replica_set() {
        let options = ServiceOptions {
            port: Some(27018),
            replica_set: Some("rs0".into()),
            ..ServiceOptions::default()
        };
        assert_eq!(
            Mongo.command(&options),
            vec!["--port", "27018", "--replSet", "rs0"]
        );
    }

    #[test]
    fn default_port_is_not_repeated_on_the_command_line() {
        let options = ServiceOptions {
            port: Some(MONGO_PORT),
            ..ServiceOptions::default()
        };
        assert!(Mongo.command(&options).is_empty());
    }

    #[test]
    fn reset_keeps_system_databases() {
        let script = Mongo::reset_script();
        assert!(script.contains("!['admin', 'config', 'local'].includes(name)"));
        assert!(script.contains("dropDatabase()"));
    }

    #[test]
    fn uris_follow_the_service_scheme() {
        assert_eq!(Mongo.connection_uri("172.18.0.2", 27017), "mongodb://172.18.0.2:27017/");
        assert_eq!(
            HttpServer::new("nginx").connection_uri("172.18.0.3", 80),
            "http://172.18.0.3:80"
        );
    }

    #[test]
    fn http_server_tags_its_image() {
        assert_eq!(HttpServer::new("nginx").image(&VersionKey::latest()), "nginx:latest");
        assert_eq!(HttpServer::new("nginx").port(), 80);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ServiceOptions =
            serde_json::from_str(r#"{"replica_set": "rs0", "client_args": {"w": 1}}"#).unwrap();
        assert_eq!(options.port, None);
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert_eq!(options.client_args["w"], 1);
    }
}
