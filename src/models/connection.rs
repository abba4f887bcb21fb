//! Connection targets.
//!
//! A `ConnectionSpec` names the physical database a data source connects to.
//! Its type code partitions pooled connections: a connection opened under one
//! spec is never handed out after the spec changes.

use crate::cache::CacheKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Includes MariaDB
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySql)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// URL and credentials of a physical database.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Contains sensitive data when credentials are inline - never log
    #[serde(skip_serializing)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Never serialized
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ConnectionSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        user: Option<impl Into<String>>,
        password: Option<impl Into<String>>,
    ) -> Self {
        self.user = user.map(Into::into);
        self.password = password.map(Into::into);
        self
    }

    pub fn db_type(&self) -> Option<DatabaseType> {
        DatabaseType::from_connection_string(&self.url)
    }

    /// Stable code identifying this url/user/password combination.
    pub fn type_code(&self) -> i32 {
        CacheKey::from_values([
            self.url.as_str(),
            self.user.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or(""),
        ])
        .hashcode()
    }

    /// Get a display-safe version of the URL (credentials masked).
    pub fn masked_url(&self) -> String {
        let Some(scheme_end) = self.url.find("://").map(|i| i + 3) else {
            return self.url.clone();
        };
        let (scheme, rest) = self.url.split_at(scheme_end);
        if let Some(at_pos) = rest.find('@') {
            if let Some(colon_pos) = rest[..at_pos].find(':') {
                return format!("{}{}:****{}", scheme, &rest[..colon_pos], &rest[at_pos..]);
            }
        }
        self.url.clone()
    }
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("url", &self.masked_url())
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{} (user {})", self.masked_url(), user),
            None => write!(f, "{}", self.masked_url()),
        }
    }
}
