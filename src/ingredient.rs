//! The ingredient model.
//!
//! Ingredients are tagged records: dimensions, metrics, filters,
//! havings, and invalid placeholders. They carry the lowered columns,
//! role bookkeeping, formatters, and quickselects that the recipe
//! assembler brews into a query.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::datatype::{Datatype, Value};
use crate::error::{BadIngredient, BadRecipe};
use crate::expression::dates::parse_human_date;
use crate::sql::{CastType, CompareOp, Dialect, OrderTerm, QueryTerm, SqlExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum IngredientKind {
    Dimension,
    Metric,
    Filter,
    Having,
    Invalid,
}

impl IngredientKind {
    /// Rank used for deterministic SELECT emission.
    fn rank(&self) -> u8 {
        match self {
            IngredientKind::Dimension => 0,
            IngredientKind::Metric => 1,
            IngredientKind::Filter => 2,
            IngredientKind::Having => 3,
            IngredientKind::Invalid => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GroupByStrategy {
    /// Group and order by the emitted column labels.
    #[default]
    Labels,
    /// Group and order by the underlying expressions. Used when
    /// blending produces clashing labels.
    Direct,
}

/// A post-query value transform.
pub trait Formatter: fmt::Debug + Send + Sync {
    fn apply(&self, value: &Value) -> Value;
}

/// Replaces values through a lookup table. Installed first when a
/// dimension declares a `lookup`.
#[derive(Debug, Clone)]
pub struct LookupFormatter {
    pairs: Vec<(Value, Value)>,
    /// Value for misses; `None` passes the original through.
    default: Option<Value>,
}

impl LookupFormatter {
    pub fn new(pairs: Vec<(Value, Value)>, default: Option<Value>) -> Self {
        Self { pairs, default }
    }
}

impl Formatter for LookupFormatter {
    fn apply(&self, value: &Value) -> Value {
        for (k, v) in &self.pairs {
            if k == value {
                return v.clone();
            }
        }
        self.default.clone().unwrap_or_else(|| value.clone())
    }
}

const FIRST_NAMES: &[&str] = &[
    "Alma", "Bruno", "Celia", "Dmitri", "Edith", "Felix", "Greta", "Hugo", "Iris", "Jonas",
    "Klara", "Leo", "Mona", "Nils", "Opal", "Petra",
];

const LAST_NAMES: &[&str] = &[
    "Ashford", "Birk", "Castellan", "Dunmore", "Eaves", "Fenwick", "Grange", "Holt", "Iverson",
    "Juhl", "Kessler", "Lindqvist", "Marsh", "Norwood", "Ostrander", "Pell",
];

/// Deterministic pseudonyms: the same input value always maps to the
/// same fake output, seeded from the value text. FNV-1a keeps the
/// mapping stable across processes.
#[derive(Debug, Clone)]
pub struct PseudonymFormatter {
    pattern: String,
}

impl PseudonymFormatter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    fn seed(&self, value: &Value) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in self.pattern.bytes().chain(value.to_string().bytes()) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

impl Formatter for PseudonymFormatter {
    fn apply(&self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        let seed = self.seed(value);
        let first = FIRST_NAMES[(seed % FIRST_NAMES.len() as u64) as usize];
        let last = LAST_NAMES[((seed >> 8) % LAST_NAMES.len() as u64) as usize];
        let rendered = match self.pattern.as_str() {
            "name" => format!("{first} {last}"),
            "first_name" => first.to_string(),
            "last_name" => last.to_string(),
            "email" => format!(
                "{}.{}@example.com",
                first.to_lowercase(),
                last.to_lowercase()
            ),
            pattern if pattern.contains("{}") => {
                pattern.replacen("{}", &format!("{:06}", seed % 1_000_000), 1)
            }
            pattern => format!("{pattern}-{:06}", seed % 1_000_000),
        };
        Value::Str(rendered)
    }
}

/// How an ingredient anonymizes: a prebuilt formatter, or a pattern
/// for the deterministic pseudonym formatter.
#[derive(Debug, Clone)]
pub enum AnonymizerSpec {
    Formatter(Arc<dyn Formatter>),
    Pattern(String),
}

impl AnonymizerSpec {
    pub fn build(&self) -> Arc<dyn Formatter> {
        match self {
            AnonymizerSpec::Formatter(f) => f.clone(),
            AnonymizerSpec::Pattern(p) => Arc::new(PseudonymFormatter::new(p.clone())),
        }
    }
}

/// A named prebuilt boolean expression attached to an ingredient.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedFilter {
    pub name: String,
    pub condition: SqlExpr,
}

/// A value supplied to `build_filter`: one scalar or a list.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
}

impl From<Value> for FilterValue {
    fn from(v: Value) -> Self {
        FilterValue::Scalar(v)
    }
}

impl From<Vec<Value>> for FilterValue {
    fn from(v: Vec<Value>) -> Self {
        FilterValue::List(v)
    }
}

/// How an enchanted row field is computed from the fetched row.
#[derive(Debug, Clone)]
pub enum CauldronExtra {
    /// Apply the ingredient's formatters to `source_field`.
    Formatted { source_field: String },
    /// Copy `source_field` verbatim (the dimension `_id` alias).
    Alias { source_field: String },
}

#[derive(Debug, Clone)]
pub struct Ingredient {
    pub id: String,
    pub kind: IngredientKind,
    /// SELECT columns in role order.
    pub columns: Vec<SqlExpr>,
    /// Role name for each column, parallel to `columns`.
    pub role_keys: Vec<String>,
    pub roles: HashMap<String, SqlExpr>,
    pub filters: Vec<SqlExpr>,
    pub havings: Vec<SqlExpr>,
    pub formatters: Vec<Arc<dyn Formatter>>,
    pub column_suffixes: Option<Vec<String>>,
    pub quickselects: Vec<NamedFilter>,
    pub datatype: Option<Datatype>,
    pub datatype_by_role: HashMap<String, Datatype>,
    pub ordering: SortOrder,
    pub group_by_strategy: GroupByStrategy,
    pub anonymizer: Option<AnonymizerSpec>,
    /// Whether the anonymizer formatter is currently installed.
    pub anonymize: bool,
    /// Extension data.
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// The error captured by an invalid ingredient.
    pub error: Option<String>,
}

impl Ingredient {
    fn base(kind: IngredientKind) -> Ingredient {
        Ingredient {
            id: String::new(),
            kind,
            columns: Vec::new(),
            role_keys: Vec::new(),
            roles: HashMap::new(),
            filters: Vec::new(),
            havings: Vec::new(),
            formatters: Vec::new(),
            column_suffixes: None,
            quickselects: Vec::new(),
            datatype: None,
            datatype_by_role: HashMap::new(),
            ordering: SortOrder::Asc,
            group_by_strategy: GroupByStrategy::Labels,
            anonymizer: None,
            anonymize: false,
            meta: serde_json::Map::new(),
            error: None,
        }
    }

    /// A metric: exactly one aggregated expression.
    pub fn metric(expr: SqlExpr) -> Ingredient {
        let mut ing = Ingredient::base(IngredientKind::Metric);
        ing.roles.insert("value".to_string(), expr.clone());
        ing.role_keys = vec!["value".to_string()];
        ing.columns = vec![expr];
        ing
    }

    /// A dimension with its required `value` role.
    pub fn dimension(expr: SqlExpr) -> Ingredient {
        let mut ing = Ingredient::base(IngredientKind::Dimension);
        ing.roles.insert("value".to_string(), expr);
        ing.rebuild_role_columns();
        ing
    }

    /// A filter wrapping one boolean expression.
    pub fn filter(expr: SqlExpr) -> Ingredient {
        let mut ing = Ingredient::base(IngredientKind::Filter);
        ing.filters = vec![expr];
        ing.datatype = Some(Datatype::Bool);
        ing
    }

    /// A having wrapping one aggregated boolean expression.
    pub fn having(expr: SqlExpr) -> Ingredient {
        let mut ing = Ingredient::base(IngredientKind::Having);
        ing.havings = vec![expr];
        ing.datatype = Some(Datatype::Bool);
        ing
    }

    /// A placeholder for an ingredient whose configuration failed to
    /// compile. Any recipe that uses it fails at assembly.
    pub fn invalid(error: impl Into<String>) -> Ingredient {
        let mut ing = Ingredient::base(IngredientKind::Invalid);
        ing.error = Some(error.into());
        ing
    }

    // ---- chainable configuration ----

    pub fn with_id(mut self, id: impl Into<String>) -> Ingredient {
        self.id = id.into();
        self
    }

    pub fn with_datatype(mut self, datatype: Option<Datatype>) -> Ingredient {
        self.datatype = datatype;
        self
    }

    /// Add a role expression to a dimension. The select-column order
    /// is recomputed: id, value, other roles ascending, order_by last.
    pub fn with_role(
        mut self,
        role: impl Into<String>,
        expr: SqlExpr,
        datatype: Option<Datatype>,
    ) -> Result<Ingredient, BadIngredient> {
        let role = role.into();
        if role == "raw" {
            return Err(BadIngredient::ReservedRole);
        }
        if let Some(dt) = datatype {
            self.datatype_by_role.insert(role.clone(), dt);
        }
        self.roles.insert(role, expr);
        self.rebuild_role_columns();
        Ok(self)
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Ingredient {
        self.formatters.push(formatter);
        self
    }

    /// Install a lookup as the first formatter.
    pub fn with_lookup(
        mut self,
        pairs: Vec<(Value, Value)>,
        default: Option<Value>,
    ) -> Ingredient {
        self.formatters
            .insert(0, Arc::new(LookupFormatter::new(pairs, default)));
        self
    }

    pub fn with_quickselects(mut self, quickselects: Vec<NamedFilter>) -> Ingredient {
        self.quickselects = quickselects;
        self
    }

    pub fn with_ordering(mut self, ordering: SortOrder) -> Ingredient {
        self.ordering = ordering;
        self
    }

    pub fn with_group_by_strategy(mut self, strategy: GroupByStrategy) -> Ingredient {
        self.group_by_strategy = strategy;
        self
    }

    pub fn with_column_suffixes(
        mut self,
        suffixes: Vec<String>,
    ) -> Result<Ingredient, BadIngredient> {
        if suffixes.len() != self.columns.len() {
            return Err(BadIngredient::SuffixCountMismatch);
        }
        self.column_suffixes = Some(suffixes);
        Ok(self)
    }

    pub fn with_anonymizer(mut self, spec: AnonymizerSpec) -> Ingredient {
        self.anonymizer = Some(spec);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Ingredient {
        self.meta.insert(key.into(), value);
        self
    }

    /// Recompute `columns`/`role_keys` from the role map.
    fn rebuild_role_columns(&mut self) {
        let mut keys: Vec<String> = Vec::new();
        if self.roles.contains_key("id") {
            keys.push("id".to_string());
        }
        if self.roles.contains_key("value") {
            keys.push("value".to_string());
        }
        let mut others: Vec<&String> = self
            .roles
            .keys()
            .filter(|k| !matches!(k.as_str(), "id" | "value" | "order_by"))
            .collect();
        others.sort();
        keys.extend(others.into_iter().cloned());
        if self.roles.contains_key("order_by") {
            keys.push("order_by".to_string());
        }
        self.columns = keys.iter().map(|k| self.roles[k].clone()).collect();
        self.role_keys = keys;
    }

    // ---- accessors ----

    /// The primary expression of this ingredient.
    pub fn expression(&self) -> Option<&SqlExpr> {
        match self.kind {
            IngredientKind::Filter => self.filters.first(),
            IngredientKind::Having => self.havings.first(),
            _ => self.columns.first(),
        }
    }

    /// Column suffixes appended to `id` when emitting the query.
    pub fn make_column_suffixes(&self) -> Result<Vec<String>, BadIngredient> {
        if let Some(suffixes) = &self.column_suffixes {
            return Ok(suffixes.clone());
        }
        if self.kind == IngredientKind::Dimension {
            let value_suffix = if self.formatters.is_empty() { "" } else { "_raw" };
            return Ok(self
                .role_keys
                .iter()
                .map(|role| {
                    if role == "value" {
                        value_suffix.to_string()
                    } else {
                        format!("_{role}")
                    }
                })
                .collect());
        }
        match self.columns.len() {
            0 => Ok(vec![]),
            1 => {
                if self.formatters.is_empty() {
                    Ok(vec![String::new()])
                } else {
                    Ok(vec!["_raw".to_string()])
                }
            }
            _ => Err(BadIngredient::SuffixCountMismatch),
        }
    }

    /// Labelled columns for the SELECT list.
    pub fn query_columns(&self) -> Result<Vec<(SqlExpr, String)>, BadIngredient> {
        let suffixes = self.make_column_suffixes()?;
        Ok(self
            .columns
            .iter()
            .zip(suffixes)
            .map(|(col, suffix)| (col.clone(), format!("{}{suffix}", self.id)))
            .collect())
    }

    /// Group-by terms per the ingredient's strategy. Only dimensions
    /// group.
    pub fn group_by_terms(&self) -> Result<Vec<QueryTerm>, BadIngredient> {
        if self.kind != IngredientKind::Dimension {
            return Ok(vec![]);
        }
        match self.group_by_strategy {
            GroupByStrategy::Labels => Ok(self
                .query_columns()?
                .into_iter()
                .map(|(_, label)| QueryTerm::Label(label))
                .collect()),
            GroupByStrategy::Direct => {
                Ok(self.columns.iter().cloned().map(QueryTerm::Expr).collect())
            }
        }
    }

    /// Order-by terms. Dimension columns are emitted in reverse so the
    /// user-visible label column drives ordering rather than the id
    /// column.
    pub fn order_by_terms(&self) -> Result<Vec<OrderTerm>, BadIngredient> {
        let descending = self.ordering == SortOrder::Desc;
        let mut terms: Vec<OrderTerm> = match self.group_by_strategy {
            GroupByStrategy::Labels => self
                .query_columns()?
                .into_iter()
                .map(|(_, label)| OrderTerm {
                    term: QueryTerm::Label(label),
                    descending,
                })
                .collect(),
            GroupByStrategy::Direct => self
                .columns
                .iter()
                .cloned()
                .map(|expr| OrderTerm {
                    term: QueryTerm::Expr(expr),
                    descending,
                })
                .collect(),
        };
        if self.kind == IngredientKind::Dimension {
            terms.reverse();
        }
        Ok(terms)
    }

    /// The label used when an auto-filter references this dimension.
    pub fn id_prop(&self) -> String {
        if self.role_keys.iter().any(|r| r == "id") {
            format!("{}_id", self.id)
        } else if self.formatters.is_empty() {
            self.id.clone()
        } else {
            format!("{}_raw", self.id)
        }
    }

    /// Extra row fields contributed after fetching.
    pub fn cauldron_extras(&self) -> Vec<(String, CauldronExtra)> {
        let mut extras = Vec::new();
        if !self.formatters.is_empty() {
            extras.push((
                self.id.clone(),
                CauldronExtra::Formatted {
                    source_field: format!("{}_raw", self.id),
                },
            ));
        }
        if self.kind == IngredientKind::Dimension {
            extras.push((
                format!("{}_id", self.id),
                CauldronExtra::Alias {
                    source_field: self.id_prop(),
                },
            ));
        }
        extras
    }

    /// Apply this ingredient's formatters in order.
    pub fn format_value(&self, value: &Value) -> Value {
        let mut value = value.clone();
        for f in &self.formatters {
            value = f.apply(&value);
        }
        value
    }

    /// Deterministic ordering: dimensions < metrics < filters <
    /// havings < others, ties broken by id.
    pub fn emission_order(&self, other: &Ingredient) -> CmpOrdering {
        (self.kind.rank(), &self.id).cmp(&(other.kind.rank(), &other.id))
    }

    // ---- filter construction ----

    /// Build a filter ingredient comparing this ingredient's column
    /// (or a role's column) to a value. Metrics produce havings.
    pub fn build_filter(
        &self,
        value: FilterValue,
        operator: Option<&str>,
        target_role: Option<&str>,
    ) -> Result<Ingredient, BadRecipe> {
        let expr = self.build_filter_expression(value, operator, target_role)?;
        if self.kind == IngredientKind::Metric {
            Ok(Ingredient::having(expr))
        } else {
            Ok(Ingredient::filter(expr))
        }
    }

    /// The bare boolean expression of `build_filter`.
    pub fn build_filter_expression(
        &self,
        value: FilterValue,
        operator: Option<&str>,
        target_role: Option<&str>,
    ) -> Result<SqlExpr, BadRecipe> {
        let (column, datatype) = match target_role {
            Some(role) if self.roles.contains_key(role) => (
                self.roles[role].clone(),
                self.datatype_by_role.get(role).copied().or(self.datatype),
            ),
            _ => (
                self.columns
                    .first()
                    .cloned()
                    .ok_or_else(|| BadRecipe::NotOnShelf(self.id.clone()))?,
                self.datatype,
            ),
        };
        match value {
            FilterValue::Scalar(v) => {
                self.build_scalar_filter(column, datatype, v, operator.unwrap_or("eq"))
            }
            FilterValue::List(vs) => {
                self.build_vector_filter(column, datatype, vs, operator.unwrap_or("in"))
            }
        }
    }

    fn coerce_value(datatype: Option<Datatype>, value: Value) -> Value {
        match (datatype, &value) {
            (Some(Datatype::Date), Value::Str(s)) => parse_human_date(s)
                .map(|dt| Value::Date(dt.date()))
                .unwrap_or(value),
            (Some(Datatype::Datetime), Value::Str(s)) => parse_human_date(s)
                .map(Value::Datetime)
                .unwrap_or(value),
            _ => value,
        }
    }

    fn build_scalar_filter(
        &self,
        column: SqlExpr,
        datatype: Option<Datatype>,
        value: Value,
        operator: &str,
    ) -> Result<SqlExpr, BadRecipe> {
        let value = Self::coerce_value(datatype, value);

        // Comparing a string to a non-string column casts the column.
        let column = match (&value, datatype) {
            (Value::Str(_), Some(dt)) if dt != Datatype::Str => SqlExpr::Cast {
                expr: Box::new(column),
                to: CastType::Text,
            },
            _ => column,
        };

        let compare = |op: CompareOp, value: Value| SqlExpr::Compare {
            op,
            left: Box::new(column.clone()),
            right: Box::new(SqlExpr::Literal(value)),
        };

        match operator {
            "eq" => {
                if value.is_null() {
                    Ok(compare(CompareOp::Is, Value::Null))
                } else {
                    Ok(compare(CompareOp::Eq, value))
                }
            }
            "ne" => Ok(compare(CompareOp::Ne, value)),
            "lt" => Ok(compare(CompareOp::Lt, value)),
            "lte" => Ok(compare(CompareOp::Lte, value)),
            "gt" => Ok(compare(CompareOp::Gt, value)),
            "gte" => Ok(compare(CompareOp::Gte, value)),
            "is" => Ok(compare(CompareOp::Is, value)),
            "isnot" => Ok(compare(CompareOp::IsNot, value)),
            "like" => Ok(SqlExpr::Like {
                expr: Box::new(column),
                pattern: Box::new(SqlExpr::Literal(Value::Str(value.to_string()))),
                case_insensitive: false,
            }),
            "ilike" => Ok(SqlExpr::Like {
                expr: Box::new(column),
                pattern: Box::new(SqlExpr::Literal(Value::Str(value.to_string()))),
                case_insensitive: true,
            }),
            "quickselect" => {
                let name = value.to_string();
                self.quickselect_condition(&name)
            }
            "in" | "notin" | "between" => {
                Err(BadRecipe::ScalarWithVectorOperator(operator.to_string()))
            }
            other => Err(BadRecipe::UnknownOperator(other.to_string())),
        }
    }

    fn build_vector_filter(
        &self,
        column: SqlExpr,
        datatype: Option<Datatype>,
        values: Vec<Value>,
        operator: &str,
    ) -> Result<SqlExpr, BadRecipe> {
        let values: Vec<Value> = values
            .into_iter()
            .map(|v| Self::coerce_value(datatype, v))
            .collect();

        match operator {
            "in" | "notin" => {
                let negated = operator == "notin";
                let has_null = values.iter().any(Value::is_null);
                let mut rest: Vec<Value> =
                    values.into_iter().filter(|v| !v.is_null()).collect();
                // Sort so generated SQL is deterministic for caching.
                sort_values(&mut rest);
                let list = SqlExpr::InList {
                    expr: Box::new(column.clone()),
                    list: rest.iter().cloned().map(SqlExpr::Literal).collect(),
                    negated,
                };
                let null_check = SqlExpr::Compare {
                    op: if negated { CompareOp::IsNot } else { CompareOp::Is },
                    left: Box::new(column),
                    right: Box::new(SqlExpr::Literal(Value::Null)),
                };
                Ok(match (has_null, rest.is_empty()) {
                    (false, _) => list,
                    (true, true) => null_check,
                    (true, false) if negated => SqlExpr::And(vec![null_check, list]),
                    (true, false) => SqlExpr::Or(vec![null_check, list]),
                })
            }
            "between" => {
                if values.len() != 2 {
                    return Err(BadRecipe::BetweenBounds);
                }
                let mut iter = values.into_iter();
                let low = iter.next().expect("two bounds");
                let high = iter.next().expect("two bounds");
                Ok(SqlExpr::Between {
                    expr: Box::new(column),
                    low: Box::new(SqlExpr::Literal(low)),
                    high: Box::new(SqlExpr::Literal(high)),
                })
            }
            "quickselect" => {
                let conditions = values
                    .iter()
                    .map(|v| self.quickselect_condition(&v.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlExpr::Or(conditions))
            }
            "eq" | "ne" | "lt" | "lte" | "gt" | "gte" | "is" | "isnot" | "like" | "ilike" => {
                Err(BadRecipe::VectorWithScalarOperator(operator.to_string()))
            }
            other => Err(BadRecipe::UnknownOperator(other.to_string())),
        }
    }

    /// The condition of a named quickselect.
    pub fn quickselect_condition(&self, name: &str) -> Result<SqlExpr, BadRecipe> {
        self.quickselects
            .iter()
            .find(|qs| qs.name == name)
            .map(|qs| qs.condition.clone())
            .ok_or_else(|| BadRecipe::UnknownQuickselect {
                name: name.to_string(),
                id: self.id.clone(),
            })
    }

    /// A short description used in multi-source error reporting.
    pub fn describe(&self, dialect: Dialect) -> String {
        let exprs: Vec<String> = self.columns.iter().map(|c| c.sql(dialect)).collect();
        format!("({}){} {}", self.kind, self.id, exprs.join(" "))
    }
}

/// Deterministic value ordering for IN lists.
fn sort_values(values: &mut [Value]) {
    values.sort_by(|a, b| {
        let ka = (value_rank(a), a.to_string());
        let kb = (value_rank(b), b.to_string());
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => x.partial_cmp(y).unwrap_or(CmpOrdering::Equal),
            _ => ka.cmp(&kb),
        }
    });
}

fn value_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Num(_) => 2,
        Value::Str(_) => 3,
        Value::Date(_) => 4,
        Value::Datetime(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Dialect;

    fn col(name: &str) -> SqlExpr {
        SqlExpr::column("census", name)
    }

    fn state_dimension() -> Ingredient {
        Ingredient::dimension(col("state"))
            .with_id("state")
            .with_datatype(Some(Datatype::Str))
    }

    fn pop_metric() -> Ingredient {
        Ingredient::metric(SqlExpr::func("sum", vec![col("pop2000")]))
            .with_id("pop2000")
            .with_datatype(Some(Datatype::Num))
    }

    #[test]
    fn test_role_column_ordering() {
        let dim = Ingredient::dimension(col("name"))
            .with_id("hospital")
            .with_role("latitude", col("lat"), Some(Datatype::Num))
            .unwrap()
            .with_role("id", col("hospital_id"), Some(Datatype::Num))
            .unwrap()
            .with_role("order_by", col("sort_key"), Some(Datatype::Num))
            .unwrap()
            .with_role("longitude", col("lng"), Some(Datatype::Num))
            .unwrap();
        assert_eq!(
            dim.role_keys,
            vec!["id", "value", "latitude", "longitude", "order_by"]
        );
        let labels: Vec<String> = dim
            .query_columns()
            .unwrap()
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        assert_eq!(
            labels,
            vec![
                "hospital_id",
                "hospital",
                "hospital_latitude",
                "hospital_longitude",
                "hospital_order_by"
            ]
        );
    }

    #[test]
    fn test_raw_role_is_reserved() {
        let err = Ingredient::dimension(col("a"))
            .with_role("raw", col("b"), None)
            .unwrap_err();
        assert_eq!(err, BadIngredient::ReservedRole);
    }

    #[test]
    fn test_formatter_changes_value_suffix() {
        let dim = state_dimension();
        assert_eq!(dim.make_column_suffixes().unwrap(), vec![String::new()]);

        let dim = state_dimension().with_lookup(
            vec![(Value::Str("T".into()), Value::Str("Tennessee".into()))],
            None,
        );
        assert_eq!(dim.make_column_suffixes().unwrap(), vec!["_raw".to_string()]);
        assert_eq!(dim.id_prop(), "state_raw");
    }

    #[test]
    fn test_id_prop_prefers_id_role() {
        let dim = state_dimension()
            .with_role("id", col("state_code"), Some(Datatype::Str))
            .unwrap();
        assert_eq!(dim.id_prop(), "state_id");
        let plain = state_dimension();
        assert_eq!(plain.id_prop(), "state");
    }

    #[test]
    fn test_emission_order() {
        let mut items = vec![
            Ingredient::filter(col("f")).with_id("zfilter"),
            pop_metric(),
            state_dimension(),
        ];
        items.sort_by(|a, b| a.emission_order(b));
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["state", "pop2000", "zfilter"]);
    }

    #[test]
    fn test_lookup_formatter() {
        let f = LookupFormatter::new(
            vec![(Value::Str("M".into()), Value::Str("Male".into()))],
            Some(Value::Str("Unknown".into())),
        );
        assert_eq!(f.apply(&Value::Str("M".into())), Value::Str("Male".into()));
        assert_eq!(
            f.apply(&Value::Str("X".into())),
            Value::Str("Unknown".into())
        );

        let passthrough = LookupFormatter::new(vec![], None);
        assert_eq!(
            passthrough.apply(&Value::Str("X".into())),
            Value::Str("X".into())
        );
    }

    #[test]
    fn test_pseudonym_formatter_is_deterministic() {
        let f = PseudonymFormatter::new("name");
        let a1 = f.apply(&Value::Str("alice".into()));
        let a2 = f.apply(&Value::Str("alice".into()));
        let b = f.apply(&Value::Str("bob".into()));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_build_scalar_filters() {
        let dim = state_dimension();
        let f = dim
            .build_filter(FilterValue::Scalar(Value::Str("Tennessee".into())), None, None)
            .unwrap();
        assert_eq!(f.kind, IngredientKind::Filter);
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "census.state = 'Tennessee'"
        );

        let f = dim
            .build_filter(FilterValue::Scalar(Value::Null), None, None)
            .unwrap();
        assert_eq!(f.filters[0].sql(Dialect::Postgres), "census.state IS NULL");
    }

    #[test]
    fn test_metric_build_filter_is_having() {
        let met = pop_metric();
        let h = met
            .build_filter(FilterValue::Scalar(Value::Num(100.0)), Some("gt"), None)
            .unwrap();
        assert_eq!(h.kind, IngredientKind::Having);
        assert_eq!(
            h.havings[0].sql(Dialect::Postgres),
            "sum(census.pop2000) > 100"
        );
    }

    #[test]
    fn test_vector_filters_sorted_with_null_handling() {
        let dim = state_dimension();
        let f = dim
            .build_filter(
                FilterValue::List(vec![
                    Value::Str("Vermont".into()),
                    Value::Str("Tennessee".into()),
                ]),
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "census.state IN ('Tennessee', 'Vermont')"
        );

        let f = dim
            .build_filter(
                FilterValue::List(vec![Value::Null, Value::Str("Vermont".into())]),
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "(census.state IS NULL) OR (census.state IN ('Vermont'))"
        );

        let f = dim
            .build_filter(
                FilterValue::List(vec![Value::Null, Value::Str("Vermont".into())]),
                Some("notin"),
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "(census.state IS NOT NULL) AND (census.state NOT IN ('Vermont'))"
        );
    }

    #[test]
    fn test_operator_arity_errors() {
        let dim = state_dimension();
        assert!(matches!(
            dim.build_filter(FilterValue::Scalar(Value::Num(1.0)), Some("in"), None),
            Err(BadRecipe::ScalarWithVectorOperator(_))
        ));
        assert!(matches!(
            dim.build_filter(FilterValue::List(vec![]), Some("gt"), None),
            Err(BadRecipe::VectorWithScalarOperator(_))
        ));
        assert!(matches!(
            dim.build_filter(FilterValue::List(vec![Value::Num(1.0)]), Some("between"), None),
            Err(BadRecipe::BetweenBounds)
        ));
        assert!(matches!(
            dim.build_filter(FilterValue::Scalar(Value::Num(1.0)), Some("zorp"), None),
            Err(BadRecipe::UnknownOperator(_))
        ));
    }

    #[test]
    fn test_string_against_num_column_casts() {
        let age = Ingredient::dimension(col("age"))
            .with_id("age")
            .with_datatype(Some(Datatype::Num));
        let f = age
            .build_filter(FilterValue::Scalar(Value::Str("5".into())), None, None)
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "CAST(census.age AS VARCHAR) = '5'"
        );
    }

    #[test]
    fn test_date_value_coercion() {
        let d = Ingredient::dimension(col("birth_date"))
            .with_id("birth_date")
            .with_datatype(Some(Datatype::Date));
        let f = d
            .build_filter(
                FilterValue::Scalar(Value::Str("jan 1 2020".into())),
                Some("gt"),
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "census.birth_date > '2020-01-01'"
        );
    }

    #[test]
    fn test_quickselects() {
        let dim = state_dimension().with_quickselects(vec![
            NamedFilter {
                name: "southern".into(),
                condition: SqlExpr::Compare {
                    op: CompareOp::Eq,
                    left: Box::new(col("region")),
                    right: Box::new(SqlExpr::literal("south")),
                },
            },
            NamedFilter {
                name: "coastal".into(),
                condition: SqlExpr::Compare {
                    op: CompareOp::Eq,
                    left: Box::new(col("coastal")),
                    right: Box::new(SqlExpr::literal(1.0)),
                },
            },
        ]);
        let f = dim
            .build_filter(
                FilterValue::Scalar(Value::Str("southern".into())),
                Some("quickselect"),
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "census.region = 'south'"
        );

        let f = dim
            .build_filter(
                FilterValue::List(vec![
                    Value::Str("southern".into()),
                    Value::Str("coastal".into()),
                ]),
                Some("quickselect"),
                None,
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "(census.region = 'south') OR (census.coastal = 1)"
        );

        assert!(matches!(
            dim.build_filter(
                FilterValue::Scalar(Value::Str("ghost".into())),
                Some("quickselect"),
                None
            ),
            Err(BadRecipe::UnknownQuickselect { .. })
        ));
    }

    #[test]
    fn test_target_role_filters() {
        let dim = state_dimension()
            .with_role("id", col("state_code"), Some(Datatype::Str))
            .unwrap();
        let f = dim
            .build_filter(
                FilterValue::Scalar(Value::Str("TN".into())),
                None,
                Some("id"),
            )
            .unwrap();
        assert_eq!(
            f.filters[0].sql(Dialect::Postgres),
            "census.state_code = 'TN'"
        );
    }

    #[test]
    fn test_ordering_reverses_dimension_columns() {
        let dim = state_dimension()
            .with_role("id", col("state_code"), Some(Datatype::Str))
            .unwrap();
        let terms = dim.order_by_terms().unwrap();
        // Label column first (reversed), id column last.
        assert_eq!(terms[0].term, QueryTerm::Label("state".into()));
        assert_eq!(terms[1].term, QueryTerm::Label("state_id".into()));
    }
}
