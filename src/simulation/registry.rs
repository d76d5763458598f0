//! Table identifiers and the timestamp column registry
//!
//! Every table or column name that reaches SQL goes through `Ident`, which
//! only admits `[A-Za-z_][A-Za-z0-9_]*`. Queries quote identifiers and bind
//! all values, so nothing from the dataset is ever interpolated raw.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of the full (never windowed) copy of a table.
pub const FULL_PREFIX: &str = "full_";

/// Prefix reserved for simulation metadata tables.
pub const META_PREFIX: &str = "sim_";

const MAX_IDENT_LEN: usize = 128;

/// A validated SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidIdent> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && name.len() <= MAX_IDENT_LEN
            }
            None => false,
        };
        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidIdent(name))
        }
    }

    /// Normalize a free-form name (sheet, file stem, CSV header) then validate.
    pub fn normalize(raw: &str) -> Result<Self, InvalidIdent> {
        let cleaned: String = raw
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' || c == '.' { '_' } else { c })
            .collect();
        Self::new(cleaned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted for SQL.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Name of the full copy of this (live) table.
    pub fn full_table(&self) -> Ident {
        Ident(format!("{}{}", FULL_PREFIX, self.0))
    }

    /// Whether the name collides with the full/metadata namespaces.
    pub fn is_reserved(&self) -> bool {
        let lower = self.0.to_ascii_lowercase();
        lower.starts_with(FULL_PREFIX) || lower.starts_with(META_PREFIX)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = InvalidIdent;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ident::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidIdent(pub String);

impl fmt::Display for InvalidIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier {:?}", self.0)
    }
}

impl std::error::Error for InvalidIdent {}

// =============================================================================
// TIMESTAMP COLUMN REGISTRY
// =============================================================================

/// Which column carries event time for each table.
///
/// Tables absent from the registry are always exposed in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRegistry {
    columns: BTreeMap<Ident, Ident>,
}

impl TimestampRegistry {
    pub fn empty() -> Self {
        Self {
            columns: BTreeMap::new(),
        }
    }

    /// Build from a name → column map, validating both sides.
    pub fn from_map<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, InvalidIdent> {
        let mut registry = Self::empty();
        for (table, column) in entries {
            registry.register(Ident::normalize(table)?, Ident::normalize(column)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, table: Ident, column: Ident) {
        self.columns.insert(table, column);
    }

    pub fn column_for(&self, table: &Ident) -> Option<&Ident> {
        self.columns.get(table)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Default for TimestampRegistry {
    /// Event-time columns of the exchange dataset.
    fn default() -> Self {
        let mut registry = Self::empty();
        for (table, column) in default_timestamp_columns() {
            if let (Ok(t), Ok(c)) = (Ident::new(table), Ident::new(column)) {
                registry.register(t, c);
            }
        }
        registry
    }
}

/// Default event-time columns, also used as the config default.
pub fn default_timestamp_columns() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Trade", "ts"),
        ("Funding", "ts"),
        ("Reward", "ts"),
        ("IP", "ts"),
        ("Spec", "day"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_validation() {
        assert!(Ident::new("Trade").is_ok());
        assert!(Ident::new("_tmp2").is_ok());
        assert!(Ident::new("2fast").is_err());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("Trade\"; DROP TABLE x; --").is_err());
        assert!(Ident::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(Ident::normalize(" IP log ").unwrap().as_str(), "IP_log");
        assert_eq!(Ident::normalize("funding-fee").unwrap().as_str(), "funding_fee");
        assert!(Ident::normalize("fee (%)").is_err());
    }

    #[test]
    fn test_full_and_reserved() {
        let trade = Ident::new("Trade").unwrap();
        assert_eq!(trade.full_table().as_str(), "full_Trade");
        assert_eq!(trade.quoted(), "\"Trade\"");
        assert!(!trade.is_reserved());
        assert!(trade.full_table().is_reserved());
        assert!(Ident::new("SIM_clock").unwrap().is_reserved());
    }

    #[test]
    fn test_default_registry() {
        let registry = TimestampRegistry::default();
        assert_eq!(registry.len(), 5);
        let spec = Ident::new("Spec").unwrap();
        assert_eq!(registry.column_for(&spec).unwrap().as_str(), "day");
        assert!(registry.column_for(&Ident::new("Account").unwrap()).is_none());
    }

    #[test]
    fn test_from_map_validates() {
        let mut map = BTreeMap::new();
        map.insert("Orders".to_string(), "created at".to_string());
        let registry = TimestampRegistry::from_map(&map).unwrap();
        let orders = Ident::new("Orders").unwrap();
        assert_eq!(registry.column_for(&orders).unwrap().as_str(), "created_at");

        map.insert("Bad(".to_string(), "ts".to_string());
        assert!(TimestampRegistry::from_map(&map).is_err());
    }
}
