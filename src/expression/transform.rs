//! Tree lowering.
//!
//! Turns a validated syntax tree into a backend expression for one
//! dialect. Literal sub-expressions stay as scalars until they embed
//! into a relational node, which is what makes literal promotion, safe
//! division, and compile-time date math possible.

use std::collections::HashMap;

use chrono::NaiveDate;

use super::ast::{BinOp, CmpOp, Expr, ExprNode, percentile_level};
use super::dates::{
    calc_date_range, convert_to_end_datetime, convert_to_eod_datetime, convert_to_start_datetime,
    parse_human_date,
};
use crate::datatype::{Datatype, Value};
use crate::error::{Diagnostic, GrammarError};
use crate::sql::{BinaryOp, CastType, CompareOp, Dialect, SqlExpr};

/// Snippet width for transformer errors.
const SNIPPET_SPAN: usize = 40;

/// A column's lowered form plus its datatype, keyed by rule name.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredCol {
    pub expr: SqlExpr,
    pub datatype: Datatype,
}

/// (buckets, offset) pairs for bigquery approx_quantiles percentiles.
pub(crate) fn approx_quantile_params(level: u32) -> (u32, u32) {
    match level {
        1 => (100, 1),
        5 => (20, 1),
        10 => (10, 1),
        25 => (4, 1),
        50 => (2, 1),
        75 => (4, 3),
        90 => (10, 9),
        95 => (20, 19),
        99 => (100, 99),
        _ => (100, level),
    }
}

/// A lowered node: still a scalar, or already a relational expression.
#[derive(Debug, Clone)]
pub enum Lowered {
    Scalar(Value),
    Sql(SqlExpr),
}

impl Lowered {
    pub fn into_sql(self) -> SqlExpr {
        match self {
            Lowered::Scalar(v) => SqlExpr::Literal(v),
            Lowered::Sql(e) => e,
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, Lowered::Scalar(_))
    }
}

/// A lowered node with its inferred datatype.
#[derive(Debug, Clone)]
pub struct TypedLowered {
    pub val: Lowered,
    pub datatype: Option<Datatype>,
}

impl TypedLowered {
    fn sql(self) -> SqlExpr {
        self.val.into_sql()
    }

    fn scalar(value: Value) -> TypedLowered {
        let datatype = value.datatype();
        TypedLowered {
            val: Lowered::Scalar(value),
            datatype,
        }
    }

    fn expr(expr: SqlExpr, datatype: Option<Datatype>) -> TypedLowered {
        TypedLowered {
            val: Lowered::Sql(expr),
            datatype,
        }
    }
}

pub struct Transformer<'a> {
    text: &'a str,
    columns: &'a HashMap<String, LoweredCol>,
    dialect: Dialect,
    today: NaiveDate,
    pub convert_dates_with: Option<String>,
    pub convert_datetimes_with: Option<String>,
}

impl<'a> Transformer<'a> {
    pub fn new(
        text: &'a str,
        columns: &'a HashMap<String, LoweredCol>,
        dialect: Dialect,
        today: NaiveDate,
    ) -> Self {
        Transformer {
            text,
            columns,
            dialect,
            today,
            convert_dates_with: None,
            convert_datetimes_with: None,
        }
    }

    fn err(&self, message: impl Into<String>, offset: usize) -> GrammarError {
        GrammarError::new(vec![Diagnostic::at(message, self.text, offset, SNIPPET_SPAN)])
    }

    pub fn transform(&self, node: &ExprNode) -> Result<TypedLowered, GrammarError> {
        match &node.node {
            Expr::Column { rule, name } => self.lower_column(node, rule, name),
            Expr::UnknownColumn { name } => {
                Err(self.err(format!("{name} is not a valid column name"), node.start))
            }
            Expr::Str(s) => Ok(TypedLowered::scalar(Value::Str(s.clone()))),
            Expr::Num(n) => Ok(TypedLowered::scalar(Value::Num(*n))),
            Expr::Bool(b) => Ok(TypedLowered::scalar(Value::Bool(*b))),
            Expr::Null => Ok(TypedLowered::scalar(Value::Null)),
            Expr::Paren(inner) => self.transform(inner),
            Expr::Binary { op, left, right } => self.lower_binary(node, *op, left, right),
            Expr::Compare { op, left, right } => self.lower_compare(*op, left, right),
            Expr::And { left, right } => {
                let l = self.transform(left)?.sql();
                let r = self.transform(right)?.sql();
                Ok(TypedLowered::expr(flatten_and(l, r), Some(Datatype::Bool)))
            }
            Expr::Or { left, right } => {
                let l = self.transform(left)?.sql();
                let r = self.transform(right)?.sql();
                Ok(TypedLowered::expr(flatten_or(l, r), Some(Datatype::Bool)))
            }
            Expr::Not { expr } => {
                let inner = self.transform(expr)?;
                let lowered = match inner.val {
                    Lowered::Scalar(Value::Bool(b)) => Lowered::Scalar(Value::Bool(!b)),
                    other => Lowered::Sql(SqlExpr::Not(Box::new(other.into_sql()))),
                };
                Ok(TypedLowered {
                    val: lowered,
                    datatype: Some(Datatype::Bool),
                })
            }
            Expr::In {
                expr,
                negated,
                items,
            } => {
                let target = self.transform(expr)?;
                if target.val.is_scalar() {
                    return Err(self.err("This value must be a column or column expression", expr.start));
                }
                let list = items
                    .iter()
                    .map(|i| self.transform(i).map(TypedLowered::sql))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TypedLowered::expr(
                    SqlExpr::InList {
                        expr: Box::new(target.sql()),
                        list,
                        negated: *negated,
                    },
                    Some(Datatype::Bool),
                ))
            }
            Expr::Between { expr, low, high } => self.lower_between(expr, low, high),
            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => self.lower_like(expr, pattern, *case_insensitive),
            Expr::IntelligentDate { expr, offset, unit } => {
                self.lower_intelligent_date(expr, offset, unit)
            }
            Expr::Aggregation { func, arg } => self.lower_aggregation(node, func, arg.as_deref()),
            Expr::Conversion { func, args } => self.lower_conversion(node, func, args),
            Expr::If { args } => self.lower_if(args),
        }
    }

    fn lower_column(
        &self,
        node: &ExprNode,
        rule: &str,
        name: &str,
    ) -> Result<TypedLowered, GrammarError> {
        let col = self.columns.get(rule).ok_or_else(|| {
            self.err(format!("{name} is not a valid column name"), node.start)
        })?;
        let mut expr = col.expr.clone();
        let mut datatype = col.datatype;
        // Installed date conversions truncate every date/datetime
        // column reference.
        let conversion = match datatype {
            Datatype::Date => self.convert_dates_with.as_deref(),
            Datatype::Datetime => self.convert_datetimes_with.as_deref(),
            _ => None,
        };
        if let Some(unit) = conversion {
            expr = self.truncate(unit, expr, datatype == Datatype::Datetime, node.start)?;
            datatype = Datatype::Date;
        }
        Ok(TypedLowered::expr(expr, Some(datatype)))
    }

    fn lower_binary(
        &self,
        node: &ExprNode,
        op: BinOp,
        left: &ExprNode,
        right: &ExprNode,
    ) -> Result<TypedLowered, GrammarError> {
        let l = self.transform(left)?;
        let r = self.transform(right)?;

        if op == BinOp::Div {
            return self.lower_division(node, l, r);
        }

        let string_add = op == BinOp::Add
            && (l.datatype == Some(Datatype::Str) || r.datatype == Some(Datatype::Str));

        // Fold literal arithmetic so `1 + 2` stays a scalar.
        if let (Lowered::Scalar(lv), Lowered::Scalar(rv)) = (&l.val, &r.val) {
            match (op, lv, rv) {
                (BinOp::Add, Value::Num(a), Value::Num(b)) => {
                    return Ok(TypedLowered::scalar(Value::Num(a + b)));
                }
                (BinOp::Sub, Value::Num(a), Value::Num(b)) => {
                    return Ok(TypedLowered::scalar(Value::Num(a - b)));
                }
                (BinOp::Mul, Value::Num(a), Value::Num(b)) => {
                    return Ok(TypedLowered::scalar(Value::Num(a * b)));
                }
                (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                    return Ok(TypedLowered::scalar(Value::Str(format!("{a}{b}"))));
                }
                _ => {}
            }
        }

        let sql_op = match (op, string_add) {
            (BinOp::Add, true) => BinaryOp::Concat,
            (BinOp::Add, false) => BinaryOp::Add,
            (BinOp::Sub, _) => BinaryOp::Sub,
            (BinOp::Mul, _) => BinaryOp::Mul,
            (BinOp::Div, _) => unreachable!("handled above"),
        };
        let datatype = if string_add {
            Some(Datatype::Str)
        } else {
            Some(Datatype::Num)
        };
        Ok(TypedLowered::expr(
            SqlExpr::Binary {
                op: sql_op,
                left: Box::new(l.sql()),
                right: Box::new(r.sql()),
            },
            datatype,
        ))
    }

    /// SQL-safe division.
    fn lower_division(
        &self,
        node: &ExprNode,
        num: TypedLowered,
        denom: TypedLowered,
    ) -> Result<TypedLowered, GrammarError> {
        if let Lowered::Scalar(Value::Num(d)) = denom.val {
            if d == 0.0 {
                return Err(self.err("When dividing, the denominator can not be zero", node.start));
            }
            if d == 1.0 {
                return Ok(num);
            }
            return Ok(match num.val {
                Lowered::Scalar(Value::Num(n)) => TypedLowered::scalar(Value::Num(n / d)),
                other => TypedLowered::expr(
                    SqlExpr::Binary {
                        op: BinaryOp::Div,
                        left: Box::new(SqlExpr::Cast {
                            expr: Box::new(other.into_sql()),
                            to: CastType::Float,
                        }),
                        right: Box::new(SqlExpr::literal(d)),
                    },
                    Some(Datatype::Num),
                ),
            });
        }

        // Non-literal denominator: guard against division by zero.
        let denom_sql = denom.sql();
        let num_sql = match num.val {
            Lowered::Scalar(v) => SqlExpr::Literal(v),
            Lowered::Sql(e) => SqlExpr::Cast {
                expr: Box::new(e),
                to: CastType::Float,
            },
        };
        Ok(TypedLowered::expr(
            SqlExpr::Case {
                whens: vec![(
                    SqlExpr::Compare {
                        op: CompareOp::Eq,
                        left: Box::new(denom_sql.clone()),
                        right: Box::new(SqlExpr::literal(0.0)),
                    },
                    SqlExpr::Literal(Value::Null),
                )],
                else_: Some(Box::new(SqlExpr::Binary {
                    op: BinaryOp::Div,
                    left: Box::new(num_sql),
                    right: Box::new(SqlExpr::Cast {
                        expr: Box::new(denom_sql),
                        to: CastType::Float,
                    }),
                })),
            },
            Some(Datatype::Num),
        ))
    }

    fn lower_compare(
        &self,
        op: CmpOp,
        left: &ExprNode,
        right: &ExprNode,
    ) -> Result<TypedLowered, GrammarError> {
        let mut l = self.transform(left)?;
        let mut r = self.transform(right)?;
        let mut sql_op = match op {
            CmpOp::Eq => CompareOp::Eq,
            CmpOp::Ne => CompareOp::Ne,
            CmpOp::Lt => CompareOp::Lt,
            CmpOp::Lte => CompareOp::Lte,
            CmpOp::Gt => CompareOp::Gt,
            CmpOp::Gte => CompareOp::Gte,
            CmpOp::Is => CompareOp::Is,
            CmpOp::IsNot => CompareOp::IsNot,
        };

        // Literal promotion: keep the column on the left.
        if l.val.is_scalar() && !r.val.is_scalar() {
            sql_op = sql_op.swapped();
            std::mem::swap(&mut l, &mut r);
        }

        // Coerce string literals against date/datetime columns.
        if let (Lowered::Scalar(Value::Str(s)), Some(target)) = (&r.val, l.datatype)
            && matches!(target, Datatype::Date | Datatype::Datetime)
        {
            let coerced = if target == Datatype::Date {
                Value::Date(self.parse_date(s, right.start)?)
            } else {
                Value::Datetime(self.parse_datetime(s, right.start)?)
            };
            r = TypedLowered::scalar(coerced);
        }

        // NULL comparisons use IS / IS NOT.
        if matches!(r.val, Lowered::Scalar(Value::Null)) {
            sql_op = match sql_op {
                CompareOp::Eq => CompareOp::Is,
                CompareOp::Ne => CompareOp::IsNot,
                other => other,
            };
        }

        Ok(TypedLowered::expr(
            SqlExpr::Compare {
                op: sql_op,
                left: Box::new(l.sql()),
                right: Box::new(r.sql()),
            },
            Some(Datatype::Bool),
        ))
    }

    fn lower_between(
        &self,
        expr: &ExprNode,
        low: &ExprNode,
        high: &ExprNode,
    ) -> Result<TypedLowered, GrammarError> {
        let col = self.transform(expr)?;
        let mut lo = self.transform(low)?;
        let mut hi = self.transform(high)?;

        match col.datatype {
            Some(Datatype::Date) => {
                if let Lowered::Scalar(Value::Str(s)) = &lo.val {
                    lo = TypedLowered::scalar(Value::Date(self.parse_date(s, low.start)?));
                }
                if let Lowered::Scalar(Value::Str(s)) = &hi.val {
                    hi = TypedLowered::scalar(Value::Date(self.parse_date(s, high.start)?));
                }
            }
            Some(Datatype::Datetime) => {
                if let Lowered::Scalar(Value::Str(s)) = &lo.val {
                    lo = TypedLowered::scalar(Value::Datetime(
                        self.parse_datetime(s, low.start)?,
                    ));
                }
                // The upper bound of a datetime BETWEEN is pushed to
                // the end of its day.
                if let Lowered::Scalar(Value::Str(s)) = &hi.val {
                    let dt = self.parse_datetime(s, high.start)?;
                    hi = TypedLowered::scalar(Value::Datetime(convert_to_eod_datetime(dt)));
                }
            }
            _ => {}
        }

        Ok(TypedLowered::expr(
            SqlExpr::Between {
                expr: Box::new(col.sql()),
                low: Box::new(lo.sql()),
                high: Box::new(hi.sql()),
            },
            Some(Datatype::Bool),
        ))
    }

    fn lower_like(
        &self,
        expr: &ExprNode,
        pattern: &ExprNode,
        case_insensitive: bool,
    ) -> Result<TypedLowered, GrammarError> {
        let target = self.transform(expr)?;
        let pat = self.transform(pattern)?;
        let pat = match pat.val {
            Lowered::Scalar(Value::Str(s)) => {
                // Without wildcards, search anywhere in the string.
                if !s.contains('%') && !s.contains('_') {
                    Value::Str(format!("%{s}%"))
                } else {
                    Value::Str(s)
                }
            }
            other => {
                return Ok(TypedLowered::expr(
                    SqlExpr::Like {
                        expr: Box::new(target.sql()),
                        pattern: Box::new(other.into_sql()),
                        case_insensitive,
                    },
                    Some(Datatype::Bool),
                ));
            }
        };
        Ok(TypedLowered::expr(
            SqlExpr::Like {
                expr: Box::new(target.sql()),
                pattern: Box::new(SqlExpr::Literal(pat)),
                case_insensitive,
            },
            Some(Datatype::Bool),
        ))
    }

    fn lower_intelligent_date(
        &self,
        expr: &ExprNode,
        offset: &str,
        unit: &str,
    ) -> Result<TypedLowered, GrammarError> {
        let col = self.transform(expr)?;
        let (start, end) = calc_date_range(offset, unit, self.today)?;
        let (low, high) = if col.datatype == Some(Datatype::Datetime) {
            (
                Value::Datetime(convert_to_start_datetime(start)),
                Value::Datetime(convert_to_end_datetime(end)),
            )
        } else {
            (Value::Date(start), Value::Date(end))
        };
        Ok(TypedLowered::expr(
            SqlExpr::Between {
                expr: Box::new(col.sql()),
                low: Box::new(SqlExpr::Literal(low)),
                high: Box::new(SqlExpr::Literal(high)),
            },
            Some(Datatype::Bool),
        ))
    }

    fn lower_aggregation(
        &self,
        node: &ExprNode,
        func: &str,
        arg: Option<&ExprNode>,
    ) -> Result<TypedLowered, GrammarError> {
        let arg = match arg {
            None => {
                return Ok(TypedLowered::expr(SqlExpr::CountStar, Some(Datatype::Num)));
            }
            Some(a) => self.transform(a)?,
        };
        let arg_type = arg.datatype;
        let arg_sql = arg.sql();

        if let Some(level) = percentile_level(func) {
            if self.dialect == Dialect::Sqlite {
                return Err(self.err("Percentile is not supported on sqlite", node.start));
            }
            let expr = if self.dialect == Dialect::Bigquery {
                let (buckets, offset) = approx_quantile_params(level);
                SqlExpr::ApproxQuantiles {
                    expr: Box::new(arg_sql),
                    buckets,
                    offset,
                }
            } else {
                SqlExpr::PercentileCont {
                    fraction: level as f64 / 100.0,
                    expr: Box::new(arg_sql),
                }
            };
            return Ok(TypedLowered::expr(expr, Some(Datatype::Num)));
        }

        let expr = match func {
            "count_distinct" => SqlExpr::CountDistinct(Box::new(arg_sql)),
            "median" if self.dialect == Dialect::Bigquery => SqlExpr::ApproxQuantiles {
                expr: Box::new(arg_sql),
                buckets: 2,
                offset: 1,
            },
            name => SqlExpr::func(name, vec![arg_sql]),
        };
        let datatype = match func {
            "min" | "max" => arg_type,
            _ => Some(Datatype::Num),
        };
        Ok(TypedLowered::expr(expr, datatype))
    }

    fn lower_conversion(
        &self,
        node: &ExprNode,
        func: &str,
        args: &[ExprNode],
    ) -> Result<TypedLowered, GrammarError> {
        match func {
            "day" | "week" | "month" | "quarter" | "year" => {
                let arg = self.transform(&args[0])?;
                let is_datetime = arg.datatype == Some(Datatype::Datetime);
                let expr = self.truncate(func, arg.sql(), is_datetime, node.start)?;
                Ok(TypedLowered::expr(expr, Some(Datatype::Date)))
            }
            "age" => {
                if self.dialect == Dialect::Sqlite {
                    return Err(self.err("Age is not supported on sqlite", node.start));
                }
                let arg = self.transform(&args[0])?;
                Ok(TypedLowered::expr(
                    SqlExpr::Age(Box::new(arg.sql())),
                    Some(Datatype::Num),
                ))
            }
            "string" => {
                let arg = self.transform(&args[0])?;
                Ok(TypedLowered::expr(
                    SqlExpr::Cast {
                        expr: Box::new(arg.sql()),
                        to: CastType::Text,
                    },
                    Some(Datatype::Str),
                ))
            }
            "int" => {
                let arg = self.transform(&args[0])?;
                Ok(TypedLowered::expr(
                    SqlExpr::Cast {
                        expr: Box::new(arg.sql()),
                        to: CastType::Integer,
                    },
                    Some(Datatype::Num),
                ))
            }
            "coalesce" => {
                let lowered: Vec<TypedLowered> = args
                    .iter()
                    .map(|a| self.transform(a))
                    .collect::<Result<_, _>>()?;
                let datatype = lowered.iter().find_map(|l| l.datatype);
                let exprs = lowered.into_iter().map(TypedLowered::sql).collect();
                Ok(TypedLowered::expr(SqlExpr::func("coalesce", exprs), datatype))
            }
            "substr" => {
                let lowered: Vec<SqlExpr> = args
                    .iter()
                    .map(|a| self.transform(a).map(TypedLowered::sql))
                    .collect::<Result<_, _>>()?;
                if self.dialect == Dialect::Mssql {
                    if lowered.len() != 3 {
                        return Err(
                            self.err("mssql requires a starting number and a length", node.start)
                        );
                    }
                    return Ok(TypedLowered::expr(
                        SqlExpr::func("substring", lowered),
                        Some(Datatype::Str),
                    ));
                }
                Ok(TypedLowered::expr(
                    SqlExpr::func("substr", lowered),
                    Some(Datatype::Str),
                ))
            }
            "date" => self.lower_date_call(node, args),
            "datetime" => {
                let arg = self.transform(&args[0])?;
                match arg.val {
                    Lowered::Scalar(Value::Str(s)) => Ok(TypedLowered::scalar(Value::Datetime(
                        self.parse_datetime(&s, args[0].start)?,
                    ))),
                    other => Ok(TypedLowered {
                        val: other,
                        datatype: Some(Datatype::Datetime),
                    }),
                }
            }
            other => Err(self.err(format!("{other} is not a recognized function"), node.start)),
        }
    }

    fn lower_date_call(
        &self,
        node: &ExprNode,
        args: &[ExprNode],
    ) -> Result<TypedLowered, GrammarError> {
        if args.len() == 3 {
            let lowered: Vec<SqlExpr> = args
                .iter()
                .map(|a| self.transform(a).map(TypedLowered::sql))
                .collect::<Result<_, _>>()?;
            let name = if self.dialect == Dialect::Mssql {
                "datefromparts"
            } else {
                "date"
            };
            return Ok(TypedLowered::expr(
                SqlExpr::func(name, lowered),
                Some(Datatype::Date),
            ));
        }

        let arg = self.transform(&args[0])?;
        match (&arg.val, arg.datatype) {
            (Lowered::Scalar(Value::Str(s)), _) => {
                let dt = self.parse_date(s, args[0].start)?;
                Ok(TypedLowered::scalar(Value::Date(dt)))
            }
            (_, Some(Datatype::Datetime)) => {
                let expr = self.truncate("day", arg.sql(), true, node.start)?;
                Ok(TypedLowered::expr(expr, Some(Datatype::Date)))
            }
            _ => Ok(TypedLowered {
                val: arg.val,
                datatype: Some(Datatype::Date),
            }),
        }
    }

    fn lower_if(&self, args: &[ExprNode]) -> Result<TypedLowered, GrammarError> {
        let mut values = args;
        let mut else_arg = None;
        if args.len() % 2 == 1 {
            else_arg = args.last();
            values = &args[..args.len() - 1];
        }

        let mut whens = Vec::new();
        let mut datatype = None;
        for pair in values.chunks(2) {
            let cond = self.transform(&pair[0])?.sql();
            let val = self.transform(&pair[1])?;
            datatype = datatype.or(val.datatype);
            whens.push((cond, val.sql()));
        }
        let else_ = match else_arg {
            Some(arg) => {
                let val = self.transform(arg)?;
                datatype = datatype.or(val.datatype);
                Some(Box::new(val.sql()))
            }
            None => None,
        };
        Ok(TypedLowered::expr(SqlExpr::Case { whens, else_ }, datatype))
    }

    /// Date/datetime truncation for one unit, dispatched by dialect.
    fn truncate(
        &self,
        unit: &str,
        expr: SqlExpr,
        is_datetime: bool,
        offset: usize,
    ) -> Result<SqlExpr, GrammarError> {
        truncate_to_unit(self.dialect, unit, expr, is_datetime)
            .map_err(|message| self.err(message, offset))
    }

    fn parse_date(&self, s: &str, offset: usize) -> Result<NaiveDate, GrammarError> {
        parse_human_date(s)
            .map(|dt| dt.date())
            .ok_or_else(|| self.err(format!("Can't convert '{s}' to a date."), offset))
    }

    fn parse_datetime(
        &self,
        s: &str,
        offset: usize,
    ) -> Result<chrono::NaiveDateTime, GrammarError> {
        parse_human_date(s)
            .ok_or_else(|| self.err(format!("Can't convert '{s}' to a datetime."), offset))
    }
}

/// Date/datetime truncation for one unit, dispatched by dialect. Also
/// used by the structured (v1) shelf loader.
pub fn truncate_to_unit(
    dialect: Dialect,
    unit: &str,
    expr: SqlExpr,
    is_datetime: bool,
) -> Result<SqlExpr, String> {
    match dialect {
        Dialect::Bigquery => {
            let unit_kw = if unit == "week" { "week(monday)" } else { unit };
            if is_datetime {
                // timestamp_trunc output must be re-wrapped so BETWEEN
                // comparisons stay DATETIME-typed.
                Ok(SqlExpr::func(
                    "datetime",
                    vec![SqlExpr::func(
                        "timestamp_trunc",
                        vec![expr, SqlExpr::Keyword(unit_kw.to_string())],
                    )],
                ))
            } else {
                Ok(SqlExpr::func(
                    "date_trunc",
                    vec![expr, SqlExpr::Keyword(unit_kw.to_string())],
                ))
            }
        }
        Dialect::Mssql => {
            if unit == "week" || unit == "quarter" {
                return Err(format!("{unit} is not supported on mssql"));
            }
            let year = SqlExpr::func("year", vec![expr.clone()]);
            let month = SqlExpr::func("month", vec![expr.clone()]);
            let day = SqlExpr::func("day", vec![expr.clone()]);
            let one = SqlExpr::literal(1.0);
            let zero = SqlExpr::literal(0.0);
            let date_parts = match unit {
                "day" => vec![year, month, day],
                "month" => vec![year, month, one],
                _ => vec![year, one.clone(), one],
            };
            if is_datetime {
                let mut parts = date_parts;
                parts.extend([zero.clone(), zero.clone(), zero.clone(), zero]);
                Ok(SqlExpr::func("datetimefromparts", parts))
            } else {
                Ok(SqlExpr::func("datefromparts", date_parts))
            }
        }
        _ => Ok(SqlExpr::func(
            "date_trunc",
            vec![SqlExpr::literal(unit), expr],
        )),
    }
}

/// SQL-safe division over already-lowered expressions. Shared with the
/// structured shelf loader's `divide_by` and divide-metric paths.
pub fn safe_divide(num: SqlExpr, denom: SqlExpr) -> Result<SqlExpr, String> {
    if let Some(d) = denom.as_num() {
        if d == 0.0 {
            return Err("When dividing, the denominator can not be zero".to_string());
        }
        if d == 1.0 {
            return Ok(num);
        }
        let left = if num.is_literal() {
            num
        } else {
            SqlExpr::Cast {
                expr: Box::new(num),
                to: CastType::Float,
            }
        };
        return Ok(SqlExpr::Binary {
            op: BinaryOp::Div,
            left: Box::new(left),
            right: Box::new(denom),
        });
    }
    let num_sql = if num.is_literal() {
        num
    } else {
        SqlExpr::Cast {
            expr: Box::new(num),
            to: CastType::Float,
        }
    };
    Ok(SqlExpr::Case {
        whens: vec![(
            SqlExpr::Compare {
                op: CompareOp::Eq,
                left: Box::new(denom.clone()),
                right: Box::new(SqlExpr::literal(0.0)),
            },
            SqlExpr::Literal(Value::Null),
        )],
        else_: Some(Box::new(SqlExpr::Binary {
            op: BinaryOp::Div,
            left: Box::new(num_sql),
            right: Box::new(SqlExpr::Cast {
                expr: Box::new(denom),
                to: CastType::Float,
            }),
        })),
    })
}

fn flatten_and(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    let mut items = match left {
        SqlExpr::And(items) => items,
        other => vec![other],
    };
    match right {
        SqlExpr::And(more) => items.extend(more),
        other => items.push(other),
    }
    SqlExpr::And(items)
}

fn flatten_or(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    let mut items = match left {
        SqlExpr::Or(items) => items,
        other => vec![other],
    };
    match right {
        SqlExpr::Or(more) => items.extend(more),
        other => items.push(other),
    }
    SqlExpr::Or(items)
}
