//! External collaborator contracts: the execution session, selectables,
//! and result rows.
//!
//! The core never opens connections or materializes rows itself; it
//! hands rendered SQL to a [`Session`] and gets typed rows back.

use std::sync::Arc;

use crate::datatype::{Datatype, StorageType, Value};
use crate::error::SessionError;
use crate::sql::Dialect;

/// A typed column exposed by a selectable.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub name: String,
    pub datatype: Datatype,
}

#[derive(Debug, Clone, PartialEq)]
enum SelectableBody {
    Table,
    Subquery { sql: String },
}

/// Something a query can select from: a named table, or a subquery with
/// an assigned alias (including a previously assembled recipe).
#[derive(Debug, Clone, PartialEq)]
pub struct Selectable {
    name: String,
    columns: Vec<SourceColumn>,
    body: SelectableBody,
}

impl Selectable {
    /// A named table with storage-typed columns.
    pub fn table<N, C>(name: N, columns: C) -> Selectable
    where
        N: Into<String>,
        C: IntoIterator<Item = (&'static str, StorageType)>,
    {
        Selectable {
            name: name.into(),
            columns: columns
                .into_iter()
                .map(|(name, storage)| SourceColumn {
                    name: name.to_string(),
                    datatype: storage.datatype(),
                })
                .collect(),
            body: SelectableBody::Table,
        }
    }

    /// A subquery with an alias and datatype-typed columns.
    pub fn subquery(
        alias: impl Into<String>,
        sql: impl Into<String>,
        columns: Vec<SourceColumn>,
    ) -> Selectable {
        Selectable {
            name: alias.into(),
            columns,
            body: SelectableBody::Subquery { sql: sql.into() },
        }
    }

    /// The table name or subquery alias used to reference columns.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[SourceColumn] {
        &self.columns
    }

    /// The from-clause item for this selectable.
    pub fn from_item(&self) -> crate::sql::FromItem {
        match &self.body {
            SelectableBody::Table => crate::sql::FromItem::Table(self.name.clone()),
            SelectableBody::Subquery { sql } => crate::sql::FromItem::Subquery {
                sql: sql.clone(),
                alias: self.name.clone(),
            },
        }
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Whether the session wrote this result to its own query cache.
    /// A caching session that did not write served the result from
    /// cache.
    pub saved_to_cache: bool,
}

/// The execution session contract. Opaque to the core: it reports its
/// driver name (which selects the SQL dialect) and runs statements.
pub trait Session {
    fn drivername(&self) -> &str;

    fn execute(&self, sql: &str) -> Result<QueryResult, SessionError>;

    fn dialect(&self) -> Dialect {
        Dialect::from_drivername(self.drivername())
    }
}

/// A named-field result row. Enchantment extends rows with new fields,
/// so the field list is shared and rows are cheap to clone.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(fields: Arc<Vec<String>>, values: Vec<Value>) -> Row {
        Row { fields, values }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        let idx = self.fields.iter().position(|f| f == field)?;
        self.values.get(idx)
    }

    /// Build a new row with `extra` fields appended.
    pub fn extend(&self, fields: Arc<Vec<String>>, extra: Vec<Value>) -> Row {
        let mut values = self.values.clone();
        values.extend(extra);
        Row { fields, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_selectable_types_columns() {
        let census = Selectable::table(
            "census",
            [
                ("state", StorageType::Text),
                ("pop2000", StorageType::Integer),
            ],
        );
        assert_eq!(census.columns()[0].datatype, Datatype::Str);
        assert_eq!(census.columns()[1].datatype, Datatype::Num);
        assert_eq!(
            census.from_item(),
            crate::sql::FromItem::Table("census".into())
        );
    }

    #[test]
    fn test_row_access_and_extend() {
        let fields = Arc::new(vec!["state".to_string(), "pop".to_string()]);
        let row = Row::new(fields, vec![Value::Str("Vermont".into()), Value::Num(609480.0)]);
        assert_eq!(row.get("state"), Some(&Value::Str("Vermont".into())));
        assert_eq!(row.get("missing"), None);

        let extended_fields = Arc::new(vec![
            "state".to_string(),
            "pop".to_string(),
            "state_id".to_string(),
        ]);
        let extended = row.extend(extended_fields, vec![Value::Str("Vermont".into())]);
        assert_eq!(extended.get("state_id"), Some(&Value::Str("Vermont".into())));
    }
}
