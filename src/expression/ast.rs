//! Parsed field syntax trees.
//!
//! The tree keeps source spans on every node and column references
//! resolved to grammar rule names. It serializes cleanly so the tree
//! cache can hold it in any string key/value store.

use serde::{Deserialize, Serialize};

/// A node with its byte span in the original field text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub start: usize,
    pub end: usize,
}

impl<T> Spanned<T> {
    pub fn new(node: T, start: usize, end: usize) -> Self {
        Self { node, start, end }
    }
}

pub type ExprNode = Spanned<Expr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    /// The verb used in math diagnostics.
    pub fn verb(&self) -> &'static str {
        match self {
            BinOp::Add => "added together",
            BinOp::Sub => "subtracted",
            BinOp::Mul => "multiplied together",
            BinOp::Div => "divided",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A resolved column terminal: grammar rule plus user-facing name.
    Column { rule: String, name: String },
    /// A name that matched no catalog column.
    UnknownColumn { name: String },
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Binary {
        op: BinOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Compare {
        op: CmpOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    And {
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Or {
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Not { expr: Box<ExprNode> },
    In {
        expr: Box<ExprNode>,
        negated: bool,
        items: Vec<ExprNode>,
    },
    Between {
        expr: Box<ExprNode>,
        low: Box<ExprNode>,
        high: Box<ExprNode>,
    },
    Like {
        expr: Box<ExprNode>,
        pattern: Box<ExprNode>,
        case_insensitive: bool,
    },
    /// `col IS {offset} {unit}` — compiled to a literal date range.
    IntelligentDate {
        expr: Box<ExprNode>,
        offset: String,
        unit: String,
    },
    /// `sum(x)`, `count(*)` (arg `None`), `percentile25(x)`, …
    Aggregation {
        func: String,
        arg: Option<Box<ExprNode>>,
    },
    /// Date/string/int intrinsics: `month(d)`, `age(d)`, `date("…")`,
    /// `string(x)`, `coalesce(a, b)`, `substr(s, 1, 2)`.
    Conversion { func: String, args: Vec<ExprNode> },
    /// Variadic `IF(bool, val [, bool, val]*, [else])`; the odd/even
    /// split happens during validation and lowering.
    If { args: Vec<ExprNode> },
    Paren(Box<ExprNode>),
}

/// Aggregation function names the grammar accepts.
pub fn is_aggregation_name(name: &str) -> bool {
    matches!(
        name,
        "sum" | "min" | "max" | "avg" | "average" | "count" | "count_distinct" | "median"
    ) || percentile_level(name).is_some()
}

/// `percentile25` → `Some(25)`.
pub fn percentile_level(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("percentile")?;
    if digits.is_empty() || digits.len() > 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Conversion/intrinsic function names the grammar accepts.
pub fn is_conversion_name(name: &str) -> bool {
    matches!(
        name,
        "day"
            | "week"
            | "month"
            | "quarter"
            | "year"
            | "age"
            | "string"
            | "int"
            | "coalesce"
            | "substr"
            | "date"
            | "datetime"
    )
}

/// Intelligent date offsets: prior/last/previous, current/this, next.
pub fn is_intelligent_offset(word: &str) -> bool {
    matches!(
        word,
        "prior" | "last" | "previous" | "current" | "this" | "next"
    )
}

/// Intelligent date units.
pub fn is_intelligent_unit(word: &str) -> bool {
    matches!(word, "ytd" | "year" | "qtr" | "month" | "mtd" | "day")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_levels() {
        assert_eq!(percentile_level("percentile25"), Some(25));
        assert_eq!(percentile_level("percentile5"), Some(5));
        assert_eq!(percentile_level("percentile"), None);
        assert_eq!(percentile_level("percentile255"), None);
        assert_eq!(percentile_level("median"), None);
    }

    #[test]
    fn test_name_sets() {
        assert!(is_aggregation_name("count_distinct"));
        assert!(is_aggregation_name("percentile99"));
        assert!(!is_aggregation_name("month"));
        assert!(is_conversion_name("month"));
        assert!(!is_conversion_name("sum"));
    }

    #[test]
    fn test_tree_serde_round_trip() {
        let node = Spanned::new(
            Expr::Binary {
                op: BinOp::Add,
                left: Box::new(Spanned::new(
                    Expr::Column {
                        rule: "num_0".into(),
                        name: "age".into(),
                    },
                    0,
                    3,
                )),
                right: Box::new(Spanned::new(Expr::Num(1.0), 6, 7)),
            },
            0,
            7,
        );
        let json = serde_json::to_string(&node).unwrap();
        let back: ExprNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
