//! Store configuration types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum length of a container or queue name
const MIN_NAME_LEN: usize = 3;

/// Maximum length of a container or queue name
const MAX_NAME_LEN: usize = 63;

/// Configuration for a single blob container or queue
///
/// The connection string carries the account endpoints and, optionally, a
/// shared key or SAS token. It is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend connection descriptor
    pub connection_string: String,

    /// Container or queue name
    pub name: String,
}

impl StoreConfig {
    /// Create a new store configuration
    pub fn new(connection_string: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            name: name.into(),
        }
    }

    /// Check the configuration before any connection is made
    ///
    /// Container and queue names share the same rules: 3 to 63 characters,
    /// lowercase letters, digits and single dashes, starting and ending with
    /// a letter or digit.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "connection string is empty".to_string(),
            });
        }

        let name = &self.name;
        let invalid = |reason: &str| Error::InvalidConfig {
            message: format!("invalid name {:?}: {}", name, reason),
        };

        if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("only lowercase letters, digits and dashes are allowed"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must start and end with a letter or digit"));
        }
        if name.contains("--") {
            return Err(invalid("consecutive dashes are not allowed"));
        }

        Ok(())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("connection_string", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}
