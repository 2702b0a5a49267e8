//! Target SQL dialects.
//!
//! Dialect differences are confined to this module and the expression
//! renderer: date truncation style, age arithmetic, percentile support,
//! native ILIKE, and string concatenation.

use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Redshift,
    Bigquery,
    Mssql,
}

impl Dialect {
    /// Resolve a dialect from a session driver name by prefix match.
    ///
    /// Canonical driver names: `sqlite`, `postgresql+psycopg2`,
    /// `redshift+psycopg2`, `bigquery`, `mssql`. Unknown drivers fall
    /// back to postgres-style SQL.
    pub fn from_drivername(drivername: &str) -> Dialect {
        let d = drivername.to_ascii_lowercase();
        if d.starts_with("sqlite") {
            Dialect::Sqlite
        } else if d.starts_with("redshift") {
            Dialect::Redshift
        } else if d.starts_with("bigquery") {
            Dialect::Bigquery
        } else if d.starts_with("mssql") {
            Dialect::Mssql
        } else {
            Dialect::Postgres
        }
    }

    /// Dialects with a native case-insensitive LIKE.
    pub fn has_native_ilike(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Redshift)
    }

    /// Percentile and median aggregations are unavailable on sqlite.
    pub fn supports_percentiles(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// The string concatenation operator.
    pub fn concat_operator(&self) -> &'static str {
        match self {
            Dialect::Mssql => "+",
            _ => "||",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_drivername_prefixes() {
        assert_eq!(Dialect::from_drivername("sqlite"), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_drivername("postgresql+psycopg2"),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_drivername("redshift+psycopg2"),
            Dialect::Redshift
        );
        assert_eq!(Dialect::from_drivername("bigquery"), Dialect::Bigquery);
        assert_eq!(Dialect::from_drivername("mssql+pyodbc"), Dialect::Mssql);
        assert_eq!(Dialect::from_drivername("unknown"), Dialect::Postgres);
    }

    #[test]
    fn test_capabilities() {
        assert!(Dialect::Postgres.has_native_ilike());
        assert!(!Dialect::Sqlite.has_native_ilike());
        assert!(!Dialect::Sqlite.supports_percentiles());
        assert_eq!(Dialect::Mssql.concat_operator(), "+");
        assert_eq!(Dialect::Sqlite.concat_operator(), "||");
    }
}
