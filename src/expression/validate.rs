//! Tree validation.
//!
//! A single walk over the parsed tree that infers the datatype of every
//! sub-expression and collects typed diagnostics with caret snippets.
//! Also records whether any aggregation was seen and the datatype of
//! the root expression, both consumed by the transformer.

use serde::{Deserialize, Serialize};

use super::ast::{BinOp, CmpOp, Expr, ExprNode, percentile_level};
use crate::datatype::Datatype;
use crate::error::Diagnostic;
use crate::sql::Dialect;

/// Snippet width around the offending token.
const SNIPPET_SPAN: usize = 200;

/// The validator's verdict, carried alongside the tree in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub found_aggregation: bool,
    pub last_datatype: Option<Datatype>,
}

pub struct Validator<'a> {
    text: &'a str,
    forbid_aggregation: bool,
    dialect: Dialect,
    pub found_aggregation: bool,
    pub last_datatype: Option<Datatype>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> Validator<'a> {
    pub fn new(text: &'a str, forbid_aggregation: bool, dialect: Dialect) -> Self {
        Validator {
            text,
            forbid_aggregation,
            dialect,
            found_aggregation: false,
            last_datatype: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn validate(&mut self, root: &ExprNode) -> Validation {
        self.last_datatype = self.check(root);
        Validation {
            found_aggregation: self.found_aggregation,
            last_datatype: self.last_datatype,
        }
    }

    fn error(&mut self, message: String, offset: usize) {
        self.diagnostics
            .push(Diagnostic::at(message, self.text, offset, SNIPPET_SPAN));
    }

    /// Infer the datatype of a node, recording diagnostics along the
    /// way. Returns `None` for NULL and for nodes that failed to type,
    /// which suppresses cascading errors upstream.
    fn check(&mut self, node: &ExprNode) -> Option<Datatype> {
        match &node.node {
            Expr::Column { rule, name } => {
                let datatype = rule_datatype(rule);
                if datatype == Some(Datatype::Unusable) {
                    self.error(
                        format!(
                            "{name} is a data type that can't be used. Usable data types \
                             are strings, numbers, boolean, dates, and datetimes"
                        ),
                        node.start,
                    );
                    return None;
                }
                datatype
            }
            Expr::UnknownColumn { name } => {
                self.error(format!("{name} is not a valid column name"), node.start);
                None
            }
            Expr::Str(_) => Some(Datatype::Str),
            Expr::Num(_) => Some(Datatype::Num),
            Expr::Bool(_) => Some(Datatype::Bool),
            Expr::Null => None,
            Expr::Paren(inner) => self.check(inner),
            Expr::Binary { op, left, right } => self.check_binary(node, *op, left, right),
            Expr::Compare { op, left, right } => self.check_compare(*op, left, right),
            Expr::And { left, right } | Expr::Or { left, right } => {
                for side in [left, right] {
                    let dt = self.check(side);
                    if dt.is_some() && dt != Some(Datatype::Bool) {
                        self.error(
                            "This should be a boolean column or expression".to_string(),
                            side.start,
                        );
                    }
                }
                Some(Datatype::Bool)
            }
            Expr::Not { expr } => {
                let dt = self.check(expr);
                if dt.is_some() && dt != Some(Datatype::Bool) {
                    self.error("NOT requires a boolean value".to_string(), node.start);
                }
                Some(Datatype::Bool)
            }
            Expr::In { expr, items, .. } => self.check_in(expr, items),
            Expr::Between { expr, low, high } => self.check_between(node, expr, low, high),
            Expr::Like { expr, pattern, .. } => {
                let dt = self.check(expr);
                self.check(pattern);
                if dt.is_some() && dt != Some(Datatype::Str) {
                    self.error(
                        format!(
                            "Can't compare {} to string",
                            dt.unwrap().grammar_name()
                        ),
                        expr.start,
                    );
                }
                Some(Datatype::Bool)
            }
            Expr::IntelligentDate { expr, .. } => {
                let dt = self.check(expr);
                if dt.is_some() && !matches!(dt, Some(Datatype::Date | Datatype::Datetime)) {
                    self.error(
                        format!("Can't compare {} to date", dt.unwrap().grammar_name()),
                        expr.start,
                    );
                }
                Some(Datatype::Bool)
            }
            Expr::Aggregation { func, arg } => self.check_aggregation(node, func, arg.as_deref()),
            Expr::Conversion { func, args } => self.check_conversion(node, func, args),
            Expr::If { args } => self.check_if(args),
        }
    }

    fn check_binary(
        &mut self,
        node: &ExprNode,
        op: BinOp,
        left: &ExprNode,
        right: &ExprNode,
    ) -> Option<Datatype> {
        let lt = self.check(left);
        let rt = self.check(right);
        let (lt, rt) = (lt?, rt?);
        match (op, lt, rt) {
            (_, Datatype::Num, Datatype::Num) => Some(Datatype::Num),
            (BinOp::Add, Datatype::Str, Datatype::Str) => Some(Datatype::Str),
            _ => {
                self.error(
                    format!(
                        "{} and {} can not be {}",
                        lt.grammar_name(),
                        rt.grammar_name(),
                        op.verb()
                    ),
                    node.start,
                );
                None
            }
        }
    }

    fn check_compare(&mut self, _op: CmpOp, left: &ExprNode, right: &ExprNode) -> Option<Datatype> {
        let lt = self.check(left);
        let rt = self.check(right);
        if let (Some(lt), Some(rt)) = (lt, rt)
            && lt != rt
            && !compatible_comparison(lt, rt)
        {
            self.error(
                format!(
                    "Can't compare {} to {}",
                    lt.grammar_name(),
                    rt.grammar_name()
                ),
                left.start,
            );
        }
        Some(Datatype::Bool)
    }

    fn check_in(&mut self, expr: &ExprNode, items: &[ExprNode]) -> Option<Datatype> {
        let dt = self.check(expr);
        if matches!(
            expr.node,
            Expr::Str(_) | Expr::Num(_) | Expr::Bool(_) | Expr::Null
        ) {
            self.error("Must be a column or expression".to_string(), expr.start);
        }

        let mut item_type: Option<Datatype> = None;
        let mut mixed = false;
        for item in items {
            let it = self.check(item);
            if let (Some(prev), Some(it)) = (item_type, it)
                && prev != it
            {
                mixed = true;
            }
            item_type = item_type.or(it);
        }
        if mixed {
            self.error(
                "An array may not contain both strings and numbers".to_string(),
                items.first().map(|i| i.start).unwrap_or(expr.start),
            );
        } else if let (Some(dt), Some(it)) = (dt, item_type)
            && dt != it
            && !compatible_comparison(dt, it)
        {
            self.error(
                format!("Can't compare {} to {}", dt.grammar_name(), it.grammar_name()),
                expr.start,
            );
        }
        Some(Datatype::Bool)
    }

    fn check_between(
        &mut self,
        node: &ExprNode,
        expr: &ExprNode,
        low: &ExprNode,
        high: &ExprNode,
    ) -> Option<Datatype> {
        let ct = self.check(expr);
        let lt = self.check(low);
        let ht = self.check(high);
        if let (Some(ct), Some(lt), Some(ht)) = (ct, lt, ht) {
            let ok = if matches!(ct, Datatype::Date | Datatype::Datetime) {
                // Bounds may be dates, datetimes, or strings (coerced).
                let bound_ok = |t: Datatype| {
                    matches!(t, Datatype::Date | Datatype::Datetime | Datatype::Str)
                };
                bound_ok(lt) && bound_ok(ht)
            } else {
                ct == lt && ct == ht
            };
            if !ok {
                self.error(
                    format!(
                        "When using between, the column ({}) and between values \
                         ({}, {}) must be the same data type.",
                        ct.grammar_name(),
                        lt.grammar_name(),
                        ht.grammar_name()
                    ),
                    node.start,
                );
            }
        }
        Some(Datatype::Bool)
    }

    fn check_aggregation(
        &mut self,
        node: &ExprNode,
        func: &str,
        arg: Option<&ExprNode>,
    ) -> Option<Datatype> {
        self.found_aggregation = true;
        if self.forbid_aggregation {
            self.error(
                "Aggregations are not allowed in this field.".to_string(),
                node.start,
            );
        }

        if let Some(level) = percentile_level(func) {
            if !matches!(level, 1 | 5 | 10 | 25 | 50 | 75 | 90 | 95 | 99) {
                self.error(
                    format!("Percentile values of {level} are not supported."),
                    node.start,
                );
            }
            if self.dialect == Dialect::Sqlite {
                self.error("Percentile is not supported on sqlite".to_string(), node.start);
            }
        }

        let arg_type = match arg {
            // count(*)
            None => return Some(Datatype::Num),
            Some(a) => self.check(a)?,
        };

        match func {
            "count" | "count_distinct" => Some(Datatype::Num),
            "min" | "max" => match arg_type {
                Datatype::Num | Datatype::Str | Datatype::Date | Datatype::Datetime => {
                    Some(arg_type)
                }
                _ => {
                    self.error_aggr(node, func, arg_type);
                    None
                }
            },
            _ => {
                // sum, avg, median, percentileNN aggregate numbers.
                if arg_type == Datatype::Num {
                    Some(Datatype::Num)
                } else {
                    self.error_aggr(node, func, arg_type);
                    None
                }
            }
        }
    }

    fn error_aggr(&mut self, node: &ExprNode, func: &str, datatype: Datatype) {
        self.error(
            format!(
                "A {} can not be aggregated using {func}.",
                datatype.grammar_name()
            ),
            node.start,
        );
    }

    fn check_conversion(
        &mut self,
        node: &ExprNode,
        func: &str,
        args: &[ExprNode],
    ) -> Option<Datatype> {
        match func {
            "day" | "week" | "month" | "quarter" | "year" | "age" => {
                let Some(arg) = args.first() else {
                    self.error(format!("{func} requires a date or datetime"), node.start);
                    return None;
                };
                let dt = self.check(arg)?;
                if matches!(dt, Datatype::Date | Datatype::Datetime) {
                    if func == "age" {
                        Some(Datatype::Num)
                    } else {
                        Some(Datatype::Date)
                    }
                } else {
                    self.error(format!("{func} requires a date or datetime"), node.start);
                    None
                }
            }
            "string" | "int" => {
                for a in args {
                    self.check(a);
                }
                if args.len() != 1 {
                    self.error(format!("{func} requires a single value"), node.start);
                    return None;
                }
                if func == "string" {
                    Some(Datatype::Str)
                } else {
                    Some(Datatype::Num)
                }
            }
            "coalesce" => {
                if args.len() != 2 {
                    self.error("coalesce requires two values".to_string(), node.start);
                    for a in args {
                        self.check(a);
                    }
                    return None;
                }
                let types: Vec<Option<Datatype>> = args.iter().map(|a| self.check(a)).collect();
                let mut found: Option<Datatype> = None;
                for (arg, t) in args.iter().zip(&types) {
                    if let Some(t) = t {
                        match found {
                            None => found = Some(*t),
                            Some(prev) if prev != *t => {
                                self.error(
                                    format!(
                                        "coalesce requires matching data types, not {} and {}",
                                        prev.grammar_name(),
                                        t.grammar_name()
                                    ),
                                    arg.start,
                                );
                            }
                            _ => {}
                        }
                    }
                }
                found
            }
            "substr" => {
                let ok = (2..=3).contains(&args.len())
                    && args
                        .iter()
                        .enumerate()
                        .all(|(i, a)| match self.check(a) {
                            Some(t) if i == 0 => t == Datatype::Str,
                            Some(t) => t == Datatype::Num,
                            None => false,
                        });
                if !ok {
                    self.error(
                        "substr requires a string and one or two numbers".to_string(),
                        node.start,
                    );
                    return None;
                }
                Some(Datatype::Str)
            }
            "date" => match args.len() {
                1 => {
                    let dt = self.check(&args[0]);
                    match dt {
                        Some(Datatype::Str) | Some(Datatype::Date) | Some(Datatype::Datetime) => {
                            Some(Datatype::Date)
                        }
                        _ => {
                            self.error(
                                "date() requires a date string or year, month, day".to_string(),
                                node.start,
                            );
                            None
                        }
                    }
                }
                3 => {
                    let all_num = args
                        .iter()
                        .all(|a| self.check(a) == Some(Datatype::Num));
                    if all_num {
                        Some(Datatype::Date)
                    } else {
                        self.error(
                            "date() requires a date string or year, month, day".to_string(),
                            node.start,
                        );
                        None
                    }
                }
                _ => {
                    self.error(
                        "date() requires a date string or year, month, day".to_string(),
                        node.start,
                    );
                    None
                }
            },
            "datetime" => {
                let dt = args.first().and_then(|a| self.check(a));
                if args.len() == 1 && dt == Some(Datatype::Str) {
                    Some(Datatype::Datetime)
                } else {
                    self.error("datetime() requires a datetime string".to_string(), node.start);
                    None
                }
            }
            _ => None,
        }
    }

    fn check_if(&mut self, args: &[ExprNode]) -> Option<Datatype> {
        let mut values = args;
        let mut else_arg = None;
        if args.len() % 2 == 1 {
            else_arg = args.last();
            values = &args[..args.len() - 1];
        }

        // Odd positions are conditions, even positions are values.
        let mut value_type: Option<Datatype> = None;
        for (i, arg) in values.iter().enumerate() {
            let dt = self.check(arg);
            if i % 2 == 0 {
                if dt.is_some() && dt != Some(Datatype::Bool) {
                    self.error(
                        "This should be a boolean column or expression".to_string(),
                        arg.start,
                    );
                }
            } else if let Some(dt) = dt {
                match value_type {
                    None => value_type = Some(dt),
                    Some(prev) if prev != dt => {
                        self.error(
                            format!(
                                "The values in this if statement must be the same type, \
                                 not {} and {}",
                                prev.grammar_name(),
                                dt.grammar_name()
                            ),
                            arg.start,
                        );
                    }
                    _ => {}
                }
            }
        }
        if let Some(else_arg) = else_arg
            && let Some(dt) = self.check(else_arg)
        {
            match value_type {
                None => value_type = Some(dt),
                Some(prev) if prev != dt => {
                    self.error(
                        format!(
                            "The values in this if statement must be the same type, \
                             not {} and {}",
                            prev.grammar_name(),
                            dt.grammar_name()
                        ),
                        else_arg.start,
                    );
                }
                _ => {}
            }
        }
        value_type
    }
}

/// The datatype encoded in a grammar rule name like `num_0`.
fn rule_datatype(rule: &str) -> Option<Datatype> {
    let prefix = rule.rsplit_once('_').map(|(p, _)| p).unwrap_or(rule);
    prefix.parse().ok()
}

/// Comparisons the validator waves through: date↔datetime, and a
/// date/datetime column against a string (coerced during lowering).
fn compatible_comparison(left: Datatype, right: Datatype) -> bool {
    matches!(
        (left, right),
        (Datatype::Date, Datatype::Datetime)
            | (Datatype::Datetime, Datatype::Date)
            | (Datatype::Date, Datatype::Str)
            | (Datatype::Datetime, Datatype::Str)
    )
}
