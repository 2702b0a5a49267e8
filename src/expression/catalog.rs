//! Column catalog.
//!
//! Introspects selectables into typed, deterministically numbered
//! column handles. The catalog drives both the grammar text (terminal
//! rules) and identifier resolution in the parser.

use std::collections::HashMap;

use crate::datatype::{Datatype, Value};
use crate::session::Selectable;
use crate::sql::{CastType, SqlExpr};

/// Only alphanumeric/underscore names can become grammar terminals.
pub fn is_valid_column(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Where a column's lowered expression comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ColSource {
    /// A column of a named selectable.
    Selectable { table: String },
    /// A constant scalar, lowered as a cast literal.
    Constant(Value),
}

/// One typed column handle: a grammar terminal plus its lowered form.
#[derive(Debug, Clone, PartialEq)]
pub struct Col {
    pub datatype: Datatype,
    pub name: String,
    pub namespace: Option<String>,
    pub source: ColSource,
    /// Position within this catalog's columns of the same datatype,
    /// assigned by [`ColCollection::assign_indexes`]. `(datatype, idx)`
    /// uniquely identifies a column in one catalog.
    pub idx: Option<usize>,
}

impl Col {
    pub fn from_selectable_column(table: &str, name: &str, datatype: Datatype) -> Option<Col> {
        if !is_valid_column(name) {
            return None;
        }
        Some(Col {
            datatype,
            name: name.to_string(),
            namespace: None,
            source: ColSource::Selectable {
                table: table.to_string(),
            },
            idx: None,
        })
    }

    /// A column backed by a scalar constant.
    pub fn from_constant(name: &str, value: &Value) -> Option<Col> {
        if !is_valid_column(name) {
            return None;
        }
        let datatype = value.datatype()?;
        Some(Col {
            datatype,
            name: name.to_string(),
            namespace: None,
            source: ColSource::Constant(value.clone()),
            idx: None,
        })
    }

    /// The grammar rule name, `"{datatype}_{idx}"`.
    pub fn rule_name(&self) -> String {
        let idx = self.idx.expect("assign_indexes must run first");
        format!("{}_{}", self.datatype, idx)
    }

    /// The user-facing field name: `"{namespace}.{name}"` when a
    /// namespace is present.
    pub fn field_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.name),
            None => self.name.clone(),
        }
    }

    /// The grammar terminal line for this column. Bracketed form is
    /// always accepted; the bare form requires a plain column name.
    pub fn as_rule(&self) -> String {
        let field = self.field_name().replace('.', "\\.");
        format!(
            "    {}: \"[\" /{field}/i \"]\" | /{field}/i",
            self.rule_name()
        )
    }

    /// The lowered backend expression for this column.
    pub fn lower(&self) -> SqlExpr {
        match &self.source {
            ColSource::Selectable { table } => SqlExpr::column(table.clone(), self.name.clone()),
            ColSource::Constant(value) => {
                let to = match self.datatype {
                    Datatype::Str => CastType::Text,
                    Datatype::Num => CastType::Float,
                    Datatype::Bool => CastType::Boolean,
                    Datatype::Date => CastType::Date,
                    Datatype::Datetime | Datatype::Unusable => CastType::Timestamp,
                };
                SqlExpr::Cast {
                    expr: Box::new(SqlExpr::Literal(value.clone())),
                    to,
                }
            }
        }
    }
}

/// An ordered collection of columns, possibly spanning several
/// selectables distinguished by namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColCollection {
    pub columns: Vec<Col>,
}

impl ColCollection {
    pub fn new(columns: Vec<Col>) -> Self {
        Self { columns }
    }

    /// Gather the usable columns of one selectable. Columns with
    /// invalid names are silently omitted; columns with unsupported
    /// storage types stay as `unusable` so the validator can explain
    /// them.
    pub fn for_selectable(selectable: &Selectable, namespace: Option<&str>) -> ColCollection {
        let mut columns = Vec::new();
        for sc in selectable.columns() {
            if let Some(col) =
                Col::from_selectable_column(selectable.name(), &sc.name, sc.datatype)
            {
                columns.push(col);
            }
        }
        let mut cc = ColCollection::new(columns);
        if let Some(ns) = namespace {
            cc.set_namespace(ns);
        }
        cc
    }

    /// Columns for a map of literal constants.
    pub fn for_constants<'a>(
        constants: impl IntoIterator<Item = (&'a String, &'a Value)>,
        namespace: Option<&str>,
    ) -> ColCollection {
        let mut columns = Vec::new();
        for (name, value) in constants {
            if let Some(col) = Col::from_constant(name, value) {
                columns.push(col);
            }
        }
        let mut cc = ColCollection::new(columns);
        if let Some(ns) = namespace {
            cc.set_namespace(ns);
        }
        cc
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        for col in &mut self.columns {
            col.namespace = Some(namespace.to_string());
        }
    }

    pub fn extend(&mut self, other: ColCollection) {
        self.columns.extend(other.columns);
    }

    /// Sort columns by `(datatype, name)` and assign per-datatype
    /// indexes so rule names are stable for a given column multiset.
    pub fn assign_indexes(&mut self) {
        self.columns
            .sort_by(|a, b| (a.datatype, &a.name).cmp(&(b.datatype, &b.name)));
        let mut idx = 0;
        let mut prev: Option<Datatype> = None;
        for col in &mut self.columns {
            if prev != Some(col.datatype) {
                idx = 0;
            }
            col.idx = Some(idx);
            prev = Some(col.datatype);
            idx += 1;
        }
    }

    /// Lookup from rule name to column.
    pub fn rule_lookup(&self) -> HashMap<String, &Col> {
        self.columns.iter().map(|c| (c.rule_name(), c)).collect()
    }

    /// Lookup from lowercased field name to column.
    pub fn field_lookup(&self) -> HashMap<String, &Col> {
        self.columns
            .iter()
            .map(|c| (c.field_name().to_lowercase(), c))
            .collect()
    }

    pub fn of_datatype(&self, datatype: Datatype) -> impl Iterator<Item = &Col> {
        self.columns.iter().filter(move |c| c.datatype == datatype)
    }
}
