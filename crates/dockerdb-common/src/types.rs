//! Domain primitive types used across the dockerdb workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from a string value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the inner string representation.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Runtime-assigned identifier (or name) of a container.
    ContainerId
);

string_id!(
    /// Runtime-assigned identifier of an exec session.
    ExecId
);

string_id!(
    /// Identifier (or name) of a runtime network.
    NetworkId
);

string_id!(
    /// Build or variant of a service, e.g. `"latest"` or `"6.0"`.
    ///
    /// Used as the instance pool lookup key.
    VersionKey
);

impl VersionKey {
    /// The version used when none is requested.
    #[must_use]
    pub fn latest() -> Self {
        Self::new("latest")
    }
}

/// Status record of an exec session as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecState {
    /// Whether the process is still running.
    pub running: bool,
    /// Exit code, absent until the process terminates.
    pub exit_code: Option<i64>,
}

impl ExecState {
    /// Returns the exit code once the process has terminated.
    #[must_use]
    pub const fn terminal_exit_code(&self) -> Option<i64> {
        if self.running { None } else { self.exit_code }
    }
}
