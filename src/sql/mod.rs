//! Backend expression tree.
//!
//! The compiler lowers field expressions into [`SqlExpr`] values, which
//! render to SQL text for a target [`Dialect`]. Rendering is
//! deterministic: identical trees produce byte-identical SQL, which is
//! what makes query caching at the session layer possible.

pub mod dialect;
pub mod query;

pub use dialect::Dialect;
pub use query::{FromItem, Join, OrderTerm, QueryTerm, SelectColumn, SelectQuery};

use crate::datatype::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// String concatenation. Renders `||` (or `+` on mssql).
    Concat,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    IsNot,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Is => "IS",
            CompareOp::IsNot => "IS NOT",
        }
    }

    /// The comparator to use when literal and column sides are swapped.
    pub fn swapped(&self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Lte => CompareOp::Gte,
            CompareOp::Gte => CompareOp::Lte,
            other => *other,
        }
    }
}

/// SQL cast targets used by the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    Float,
    Integer,
    Text,
    Date,
    Timestamp,
    Boolean,
}

impl CastType {
    fn sql_name(&self) -> &'static str {
        match self {
            CastType::Float => "FLOAT",
            CastType::Integer => "INTEGER",
            CastType::Text => "VARCHAR",
            CastType::Date => "DATE",
            CastType::Timestamp => "TIMESTAMP",
            CastType::Boolean => "BOOLEAN",
        }
    }
}

/// A lowered relational expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// A reference to a column of a named selectable.
    Column { table: String, name: String },
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Compare {
        op: CompareOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    Between {
        expr: Box<SqlExpr>,
        low: Box<SqlExpr>,
        high: Box<SqlExpr>,
    },
    Like {
        expr: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        case_insensitive: bool,
    },
    /// An ordinary function call: `name(args...)`.
    Func { name: String, args: Vec<SqlExpr> },
    /// A bare keyword argument such as bigquery's `week(monday)` unit.
    Keyword(String),
    CountStar,
    CountDistinct(Box<SqlExpr>),
    Case {
        whens: Vec<(SqlExpr, SqlExpr)>,
        else_: Option<Box<SqlExpr>>,
    },
    Cast {
        expr: Box<SqlExpr>,
        to: CastType,
    },
    /// `percentile_cont(fraction) WITHIN GROUP (ORDER BY expr)`.
    PercentileCont { fraction: f64, expr: Box<SqlExpr> },
    /// bigquery `approx_quantiles(expr, buckets)[OFFSET(offset)]`.
    ApproxQuantiles {
        expr: Box<SqlExpr>,
        buckets: u32,
        offset: u32,
    },
    /// Age in whole years of a date column, adjusted for whether the
    /// anniversary has passed this year. Dialect-specific arithmetic.
    Age(Box<SqlExpr>),
    /// `COUNT(*) OVER ()` pagination window column.
    WindowCount,
}

impl SqlExpr {
    pub fn literal(v: impl Into<Value>) -> SqlExpr {
        SqlExpr::Literal(v.into())
    }

    pub fn column(table: impl Into<String>, name: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<SqlExpr>) -> SqlExpr {
        SqlExpr::Func {
            name: name.into(),
            args,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, SqlExpr::Literal(_))
    }

    /// Numeric literal value, if this is one.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            SqlExpr::Literal(Value::Num(n)) => Some(*n),
            _ => None,
        }
    }

    /// Visit this expression and every sub-expression.
    pub fn walk(&self, f: &mut impl FnMut(&SqlExpr)) {
        f(self);
        match self {
            SqlExpr::Binary { left, right, .. } | SqlExpr::Compare { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            SqlExpr::And(items) | SqlExpr::Or(items) => {
                for item in items {
                    item.walk(f);
                }
            }
            SqlExpr::Not(inner)
            | SqlExpr::CountDistinct(inner)
            | SqlExpr::Age(inner)
            | SqlExpr::Cast { expr: inner, .. }
            | SqlExpr::PercentileCont { expr: inner, .. }
            | SqlExpr::ApproxQuantiles { expr: inner, .. } => inner.walk(f),
            SqlExpr::InList { expr, list, .. } => {
                expr.walk(f);
                for item in list {
                    item.walk(f);
                }
            }
            SqlExpr::Between { expr, low, high } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            SqlExpr::Like { expr, pattern, .. } => {
                expr.walk(f);
                pattern.walk(f);
            }
            SqlExpr::Func { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            SqlExpr::Case { whens, else_ } => {
                for (cond, val) in whens {
                    cond.walk(f);
                    val.walk(f);
                }
                if let Some(e) = else_ {
                    e.walk(f);
                }
            }
            SqlExpr::Column { .. }
            | SqlExpr::Literal(_)
            | SqlExpr::Keyword(_)
            | SqlExpr::CountStar
            | SqlExpr::WindowCount => {}
        }
    }

    /// Names of all selectables this expression references.
    pub fn referenced_tables(&self, out: &mut Vec<String>) {
        self.walk(&mut |e| {
            if let SqlExpr::Column { table, .. } = e
                && !out.contains(table)
            {
                out.push(table.clone());
            }
        });
    }

    /// True if any node is an aggregation.
    pub fn contains_aggregation(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(
                e,
                SqlExpr::CountStar
                    | SqlExpr::CountDistinct(_)
                    | SqlExpr::PercentileCont { .. }
                    | SqlExpr::ApproxQuantiles { .. }
            ) {
                found = true;
            }
            if let SqlExpr::Func { name, .. } = e
                && matches!(name.as_str(), "sum" | "min" | "max" | "avg" | "count" | "median")
            {
                found = true;
            }
        });
        found
    }

    /// Render to SQL for the given dialect.
    pub fn sql(&self, dialect: Dialect) -> String {
        match self {
            SqlExpr::Column { table, name } => format!("{table}.{name}"),
            SqlExpr::Literal(v) => v.to_sql_literal(),
            SqlExpr::Binary { op, left, right } => {
                let symbol = if *op == BinaryOp::Concat {
                    dialect.concat_operator()
                } else {
                    op.symbol()
                };
                format!(
                    "{} {} {}",
                    left.sql_grouped(dialect),
                    symbol,
                    right.sql_grouped(dialect)
                )
            }
            SqlExpr::Compare { op, left, right } => format!(
                "{} {} {}",
                left.sql_grouped(dialect),
                op.symbol(),
                right.sql_grouped(dialect)
            ),
            SqlExpr::And(items) => items
                .iter()
                .map(|i| i.sql_grouped(dialect))
                .collect::<Vec<_>>()
                .join(" AND "),
            SqlExpr::Or(items) => items
                .iter()
                .map(|i| i.sql_grouped(dialect))
                .collect::<Vec<_>>()
                .join(" OR "),
            SqlExpr::Not(inner) => format!("NOT {}", inner.sql_grouped(dialect)),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let items = list
                    .iter()
                    .map(|i| i.sql(dialect))
                    .collect::<Vec<_>>()
                    .join(", ");
                let op = if *negated { "NOT IN" } else { "IN" };
                format!("{} {} ({})", expr.sql_grouped(dialect), op, items)
            }
            SqlExpr::Between { expr, low, high } => format!(
                "{} BETWEEN {} AND {}",
                expr.sql_grouped(dialect),
                low.sql_grouped(dialect),
                high.sql_grouped(dialect)
            ),
            SqlExpr::Like {
                expr,
                pattern,
                case_insensitive,
            } => {
                if *case_insensitive && !dialect.has_native_ilike() {
                    format!(
                        "lower({}) LIKE lower({})",
                        expr.sql(dialect),
                        pattern.sql(dialect)
                    )
                } else {
                    let op = if *case_insensitive { "ILIKE" } else { "LIKE" };
                    format!(
                        "{} {} {}",
                        expr.sql_grouped(dialect),
                        op,
                        pattern.sql_grouped(dialect)
                    )
                }
            }
            SqlExpr::Func { name, args } => {
                let rendered = args
                    .iter()
                    .map(|a| a.sql(dialect))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{name}({rendered})")
            }
            SqlExpr::Keyword(k) => k.clone(),
            SqlExpr::CountStar => "count(*)".to_string(),
            SqlExpr::CountDistinct(inner) => {
                format!("count(DISTINCT {})", inner.sql(dialect))
            }
            SqlExpr::Case { whens, else_ } => {
                let mut out = String::from("CASE");
                for (cond, val) in whens {
                    out.push_str(&format!(
                        " WHEN {} THEN {}",
                        cond.sql(dialect),
                        val.sql(dialect)
                    ));
                }
                if let Some(e) = else_ {
                    out.push_str(&format!(" ELSE {}", e.sql(dialect)));
                }
                out.push_str(" END");
                out
            }
            SqlExpr::Cast { expr, to } => {
                format!("CAST({} AS {})", expr.sql(dialect), to.sql_name())
            }
            SqlExpr::PercentileCont { fraction, expr } => format!(
                "percentile_cont({fraction}) WITHIN GROUP (ORDER BY {})",
                expr.sql(dialect)
            ),
            SqlExpr::ApproxQuantiles {
                expr,
                buckets,
                offset,
            } => format!(
                "approx_quantiles({}, {buckets})[OFFSET({offset})]",
                expr.sql(dialect)
            ),
            SqlExpr::Age(expr) => render_age(expr, dialect),
            SqlExpr::WindowCount => "COUNT(*) OVER ()".to_string(),
        }
    }

    /// Render with parentheses around compound sub-expressions so
    /// operator precedence in the source tree survives verbatim.
    fn sql_grouped(&self, dialect: Dialect) -> String {
        match self {
            SqlExpr::Binary { .. }
            | SqlExpr::Compare { .. }
            | SqlExpr::And(_)
            | SqlExpr::Or(_)
            | SqlExpr::Not(_)
            | SqlExpr::Between { .. }
            | SqlExpr::Like { .. } => format!("({})", self.sql(dialect)),
            _ => self.sql(dialect),
        }
    }
}

/// Whole-year age with an adjustment for whether the month/day
/// anniversary has passed, relative to the current date.
fn render_age(expr: &SqlExpr, dialect: Dialect) -> String {
    let col = expr.sql(dialect);
    match dialect {
        Dialect::Bigquery => format!(
            "DATE_DIFF(CURRENT_DATE, {col}, YEAR) - \
             IF(EXTRACT(MONTH FROM CURRENT_DATE) + EXTRACT(DAY FROM CURRENT_DATE)/100.0 \
             < EXTRACT(MONTH FROM {col}) + EXTRACT(DAY FROM {col})/100.0, 1, 0)"
        ),
        _ => format!(
            "DATEDIFF('YEAR', {col}, CURRENT_DATE) - \
             CASE WHEN extract('month' from CURRENT_DATE) + extract('day' from CURRENT_DATE)/100.0 \
             < extract('month' from {col}) + extract('day' from {col})/100.0 THEN 1 ELSE 0 END"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Value;

    fn col(name: &str) -> SqlExpr {
        SqlExpr::column("census", name)
    }

    #[test]
    fn test_binary_grouping() {
        let expr = SqlExpr::Binary {
            op: BinaryOp::Mul,
            left: Box::new(SqlExpr::Binary {
                op: BinaryOp::Add,
                left: Box::new(col("a")),
                right: Box::new(col("b")),
            }),
            right: Box::new(SqlExpr::literal(2.0)),
        };
        assert_eq!(expr.sql(Dialect::Postgres), "(census.a + census.b) * 2");
    }

    #[test]
    fn test_concat_dialects() {
        let expr = SqlExpr::Binary {
            op: BinaryOp::Concat,
            left: Box::new(col("state")),
            right: Box::new(SqlExpr::literal("!")),
        };
        assert_eq!(expr.sql(Dialect::Sqlite), "census.state || '!'");
        assert_eq!(expr.sql(Dialect::Mssql), "census.state + '!'");
    }

    #[test]
    fn test_ilike_fallback() {
        let expr = SqlExpr::Like {
            expr: Box::new(col("state")),
            pattern: Box::new(SqlExpr::literal("t%")),
            case_insensitive: true,
        };
        assert_eq!(
            expr.sql(Dialect::Sqlite),
            "lower(census.state) LIKE lower('t%')"
        );
        assert_eq!(expr.sql(Dialect::Postgres), "census.state ILIKE 't%'");
    }

    #[test]
    fn test_case_rendering() {
        let expr = SqlExpr::Case {
            whens: vec![(
                SqlExpr::Compare {
                    op: CompareOp::Lt,
                    left: Box::new(col("age")),
                    right: Box::new(SqlExpr::literal(2.0)),
                },
                SqlExpr::literal("babies"),
            )],
            else_: Some(Box::new(SqlExpr::literal("oldsters"))),
        };
        assert_eq!(
            expr.sql(Dialect::Postgres),
            "CASE WHEN census.age < 2 THEN 'babies' ELSE 'oldsters' END"
        );
    }

    #[test]
    fn test_percentile_forms() {
        let expr = SqlExpr::PercentileCont {
            fraction: 0.25,
            expr: Box::new(col("age")),
        };
        assert_eq!(
            expr.sql(Dialect::Postgres),
            "percentile_cont(0.25) WITHIN GROUP (ORDER BY census.age)"
        );
        let bq = SqlExpr::ApproxQuantiles {
            expr: Box::new(col("age")),
            buckets: 4,
            offset: 1,
        };
        assert_eq!(
            bq.sql(Dialect::Bigquery),
            "approx_quantiles(census.age, 4)[OFFSET(1)]"
        );
    }

    #[test]
    fn test_in_list_and_null_handling() {
        let expr = SqlExpr::InList {
            expr: Box::new(col("state")),
            list: vec![SqlExpr::literal("Tennessee"), SqlExpr::literal("Vermont")],
            negated: false,
        };
        assert_eq!(
            expr.sql(Dialect::Postgres),
            "census.state IN ('Tennessee', 'Vermont')"
        );
        let isnull = SqlExpr::Compare {
            op: CompareOp::Is,
            left: Box::new(col("state")),
            right: Box::new(SqlExpr::Literal(Value::Null)),
        };
        assert_eq!(isnull.sql(Dialect::Postgres), "census.state IS NULL");
    }

    #[test]
    fn test_referenced_tables() {
        let expr = SqlExpr::Binary {
            op: BinaryOp::Add,
            left: Box::new(SqlExpr::column("a", "x")),
            right: Box::new(SqlExpr::column("b", "y")),
        };
        let mut tables = vec![];
        expr.referenced_tables(&mut tables);
        assert_eq!(tables, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_contains_aggregation() {
        assert!(SqlExpr::func("sum", vec![col("age")]).contains_aggregation());
        assert!(SqlExpr::CountStar.contains_aggregation());
        assert!(!col("age").contains_aggregation());
        // A date truncation is a function call, not an aggregation.
        assert!(
            !SqlExpr::func("date_trunc", vec![SqlExpr::literal("month"), col("dt")])
                .contains_aggregation()
        );
    }
}
