/// Shared types used across the codebase

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::database::error::DatabaseError;

/// Control-plane identifier of a customer organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OrganizationId(pub Uuid);

impl OrganizationId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for OrganizationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Name of a tenant's PostgreSQL schema.
///
/// Only constructed through [`SchemaName::parse`], so every value is safe to
/// splice into DDL and into a `search_path` connection option:
/// 1-63 characters of `[a-z0-9_]`, starting with a letter, never `public`,
/// `information_schema` or a `pg_` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    /// PostgreSQL truncates identifiers beyond this length
    pub const MAX_LEN: usize = 63;

    const RESERVED: &'static [&'static str] = &["public", "information_schema"];

    pub fn parse(name: impl Into<String>) -> Result<Self, DatabaseError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(DatabaseError::InvalidSchemaName(name))
        }
    }

    fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.len() > Self::MAX_LEN {
            return false;
        }
        if Self::RESERVED.contains(&name) || name.starts_with("pg_") {
            return false;
        }
        let mut chars = name.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        first_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier for DDL
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SchemaName {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl<'de> Deserialize<'de> for SchemaName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SchemaName::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_tenant_style_names() {
        assert!(SchemaName::parse("org_acme").is_ok());
        assert!(SchemaName::parse("org_newco_2024").is_ok());
        assert!(SchemaName::parse("a").is_ok());
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(SchemaName::parse("").is_err());
        assert!(SchemaName::parse("Org_Acme").is_err());
        assert!(SchemaName::parse("org-acme").is_err());
        assert!(SchemaName::parse("1org").is_err());
        assert!(SchemaName::parse("public").is_err());
        assert!(SchemaName::parse("pg_catalog").is_err());
        assert!(SchemaName::parse("org\"; DROP SCHEMA public; --").is_err());
        assert!(SchemaName::parse("x".repeat(64)).is_err());
    }

    #[test]
    fn deserializes_through_validation() {
        let ok: SchemaName = serde_json::from_str("\"org_acme\"").unwrap();
        assert_eq!(ok.as_str(), "org_acme");
        assert!(serde_json::from_str::<SchemaName>("\"bad name\"").is_err());
    }

    #[test]
    fn quotes_identifier() {
        let schema = SchemaName::parse("org_acme").unwrap();
        assert_eq!(schema.quoted(), "\"org_acme\"");
    }
}
