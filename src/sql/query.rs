//! SELECT statement assembly.
//!
//! [`SelectQuery`] is the structural form the recipe assembler and the
//! extensions manipulate before rendering. Labels are emitted with `AS`
//! and the `labels` group-by strategy references them by name.

use super::{Dialect, SqlExpr};

/// A labelled select column.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: SqlExpr,
    pub label: String,
}

/// Something a query can select from.
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table(String),
    Subquery { sql: String, alias: String },
}

impl FromItem {
    pub fn alias(&self) -> &str {
        match self {
            FromItem::Table(name) => name,
            FromItem::Subquery { alias, .. } => alias,
        }
    }

    fn sql(&self) -> String {
        match self {
            FromItem::Table(name) => name.clone(),
            FromItem::Subquery { sql, alias } => format!("({sql}) AS {alias}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub outer: bool,
    pub item: FromItem,
    pub on: SqlExpr,
}

/// A group-by or order-by target: an emitted label or a raw expression,
/// depending on the ingredient's group-by strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTerm {
    Label(String),
    Expr(SqlExpr),
}

impl QueryTerm {
    fn sql(&self, dialect: Dialect) -> String {
        match self {
            QueryTerm::Label(l) => l.clone(),
            QueryTerm::Expr(e) => e.sql(dialect),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub term: QueryTerm,
    pub descending: bool,
}

impl OrderTerm {
    fn sql(&self, dialect: Dialect) -> String {
        if self.descending {
            format!("{} DESC", self.term.sql(dialect))
        } else {
            self.term.sql(dialect)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub columns: Vec<SelectColumn>,
    pub from: Vec<FromItem>,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<QueryTerm>,
    pub havings: Vec<SqlExpr>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column unless an identical expression is already selected.
    pub fn add_column(&mut self, expr: SqlExpr, label: impl Into<String>) {
        let label = label.into();
        if !self
            .columns
            .iter()
            .any(|c| c.expr == expr && c.label == label)
        {
            self.columns.push(SelectColumn { expr, label });
        }
    }

    pub fn column_labels(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.label.clone()).collect()
    }

    /// Render the full statement.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut out = String::from("SELECT ");
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let rendered = c.expr.sql(dialect);
                if rendered == c.label {
                    rendered
                } else {
                    format!("{rendered} AS {}", c.label)
                }
            })
            .collect();
        out.push_str(&cols.join(", "));

        if !self.from.is_empty() {
            out.push_str(" FROM ");
            let items: Vec<String> = self.from.iter().map(|f| f.sql()).collect();
            out.push_str(&items.join(", "));
        }

        for join in &self.joins {
            let kind = if join.outer { "LEFT OUTER JOIN" } else { "JOIN" };
            out.push_str(&format!(
                " {kind} {} ON {}",
                join.item.sql(),
                join.on.sql(dialect)
            ));
        }

        if !self.filters.is_empty() {
            let parts: Vec<String> = self.filters.iter().map(|f| f.sql(dialect)).collect();
            out.push_str(&format!(" WHERE {}", parts.join(" AND ")));
        }

        if !self.group_by.is_empty() {
            let parts: Vec<String> = self.group_by.iter().map(|g| g.sql(dialect)).collect();
            out.push_str(&format!(" GROUP BY {}", parts.join(", ")));
        }

        if !self.havings.is_empty() {
            let parts: Vec<String> = self.havings.iter().map(|h| h.sql(dialect)).collect();
            out.push_str(&format!(" HAVING {}", parts.join(" AND ")));
        }

        if !self.order_by.is_empty() {
            let parts: Vec<String> = self.order_by.iter().map(|o| o.sql(dialect)).collect();
            out.push_str(&format!(" ORDER BY {}", parts.join(", ")));
        }

        if let Some(limit) = self.limit {
            out.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            out.push_str(&format!(" OFFSET {offset}"));
        }

        out
    }

    /// This query as a from-item usable in an outer query.
    pub fn as_subquery(&self, alias: impl Into<String>, dialect: Dialect) -> FromItem {
        FromItem::Subquery {
            sql: self.to_sql(dialect),
            alias: alias.into(),
        }
    }

    /// Names of every base selectable referenced anywhere in the query.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        for c in &self.columns {
            c.expr.referenced_tables(&mut tables);
        }
        for f in &self.filters {
            f.referenced_tables(&mut tables);
        }
        for h in &self.havings {
            h.referenced_tables(&mut tables);
        }
        for g in &self.group_by {
            if let QueryTerm::Expr(e) = g {
                e.referenced_tables(&mut tables);
            }
        }
        for o in &self.order_by {
            if let QueryTerm::Expr(e) = &o.term {
                e.referenced_tables(&mut tables);
            }
        }
        tables
    }
}
