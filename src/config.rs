//! Shelf construction from a configuration value-tree.
//!
//! Two accepted shapes, selected by the `_version` key:
//!
//! * v1 ("structured"): each ingredient carries an explicit `kind` and
//!   a structured `field` sub-tree (value / aggregation / condition /
//!   operators / as / default). String shorthand like `"sum(a)+b"` is
//!   normalized into the structured shape, `@name` references are
//!   substituted topologically, and the structured tree is lowered
//!   directly — never round-tripped through expression text.
//! * v2 ("parsed"): each ingredient carries raw expression strings
//!   that go through the full expression compiler.
//!
//! Compile errors on a single ingredient never poison the shelf; they
//! are captured as invalid placeholder ingredients.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value as Json;

use crate::datatype::{Datatype, Value};
use crate::error::{BadIngredient, GrammarError};
use crate::expression::transform::{approx_quantile_params, safe_divide, truncate_to_unit};
use crate::expression::{BuilderConfig, ExpressionBuilder, ParseOptions};
use crate::ingredient::{AnonymizerSpec, Ingredient, NamedFilter};
use crate::session::Selectable;
use crate::shelf::Shelf;
use crate::sql::{BinaryOp, CastType, CompareOp, Dialect, SqlExpr};

/// Number format shorthands accepted in ingredient config.
fn coerce_format(format: &str) -> &str {
    match format {
        "comma" => ",.0f",
        "dollar" => "$,.0f",
        "percent" => ".0%",
        "comma1" => ",.1f",
        "dollar1" => "$,.1f",
        "percent1" => ".1%",
        "comma2" => ",.2f",
        "dollar2" => "$,.2f",
        "percent2" => ".2%",
        other => other,
    }
}

const DEFAULT_BUCKET_LABEL: &str = "Not found";
/// Ordering slot for rows that fall into the default bucket.
const DEFAULT_BUCKET_ORDER: f64 = 9999.0;

#[derive(Debug, Clone, Deserialize)]
struct NamedConditionConfig {
    name: String,
    condition: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BucketConfig {
    label: Json,
    condition: String,
}

/// v2 ingredient configuration.
#[derive(Debug, Clone, Deserialize)]
struct ParsedIngredientConfig {
    kind: Option<String>,
    field: Option<String>,
    condition: Option<String>,
    #[serde(default)]
    quickselects: Vec<NamedConditionConfig>,
    #[serde(default)]
    buckets: Vec<BucketConfig>,
    buckets_default_label: Option<Json>,
    format: Option<String>,
    lookup: Option<serde_json::Map<String, Json>>,
    lookup_default: Option<Json>,
    anonymizer: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Json>,
}

/// Builds shelves from configuration trees over one selectable.
pub struct ShelfLoader {
    builder: ExpressionBuilder,
    selectable: Selectable,
    dialect: Dialect,
}

impl ShelfLoader {
    pub fn new(selectable: &Selectable, drivername: &str) -> Result<Self, BadIngredient> {
        Self::with_config(selectable, drivername, BuilderConfig::default())
    }

    pub fn with_config(
        selectable: &Selectable,
        drivername: &str,
        config: BuilderConfig,
    ) -> Result<Self, BadIngredient> {
        let builder = ExpressionBuilder::with_config(selectable, drivername, config)?;
        Ok(ShelfLoader {
            dialect: builder.dialect(),
            builder,
            selectable: selectable.clone(),
        })
    }

    /// Build a shelf from a configuration tree. The `_version` key
    /// selects v1 (default) or v2 semantics.
    pub fn load(&mut self, tree: &Json) -> Result<Shelf, BadIngredient> {
        let obj = tree.as_object().ok_or_else(|| {
            BadIngredient::InvalidConfig("shelf configuration must be a mapping".to_string())
        })?;
        let version = obj
            .get("_version")
            .map(|v| match v {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "1".to_string());

        let mut shelf = Shelf::new();
        match version.as_str() {
            "2" => {
                for (key, value) in obj {
                    if key == "_version" {
                        continue;
                    }
                    let ingredient = self
                        .build_parsed(value)
                        .unwrap_or_else(|e| Ingredient::invalid(e.to_string()));
                    shelf.insert(key.clone(), ingredient);
                }
            }
            _ => {
                let fields = collect_v1_field_trees(obj);
                for (key, value) in obj {
                    if key == "_version" {
                        continue;
                    }
                    let ingredient = self
                        .build_structured(key, value, &fields)
                        .unwrap_or_else(|e| Ingredient::invalid(e.to_string()));
                    shelf.insert(key.clone(), ingredient);
                }
            }
        }

        shelf.select_from = Some(self.selectable.clone());
        self.builder.save_cache();
        Ok(shelf)
    }

    // ---- v2: parsed expressions ----

    fn parse_field(
        &mut self,
        text: &str,
        options: &ParseOptions,
    ) -> Result<(SqlExpr, Option<Datatype>), BadIngredient> {
        let compiled = self.builder.parse(text, options)?;
        Ok((compiled.expr, compiled.datatype))
    }

    /// Parse a condition, accepting the partial form (`> 10`) by
    /// prefixing the ingredient's own field text.
    fn parse_condition(
        &mut self,
        condition: &str,
        subject: Option<&str>,
    ) -> Result<SqlExpr, BadIngredient> {
        let options = ParseOptions {
            forbid_aggregation: true,
            ..Default::default()
        };
        match self.builder.parse(condition, &options) {
            Ok(compiled) => Ok(compiled.expr),
            Err(first_error) => {
                if let Some(subject) = subject {
                    let combined = format!("{subject} {condition}");
                    if let Ok(compiled) = self.builder.parse(&combined, &options) {
                        return Ok(compiled.expr);
                    }
                }
                Err(first_error.into())
            }
        }
    }

    fn build_parsed(&mut self, value: &Json) -> Result<Ingredient, BadIngredient> {
        let config: ParsedIngredientConfig = serde_json::from_value(value.clone())
            .map_err(|e| BadIngredient::InvalidConfig(e.to_string()))?;
        let kind = config
            .kind
            .clone()
            .unwrap_or_else(|| "metric".to_string())
            .to_lowercase();

        let mut ingredient = match kind.as_str() {
            "metric" => {
                let field = config
                    .field
                    .as_deref()
                    .ok_or_else(|| missing("field", &kind))?;
                let (expr, datatype) = self.parse_field(
                    field,
                    &ParseOptions {
                        enforce_aggregation: true,
                        ..Default::default()
                    },
                )?;
                Ingredient::metric(expr).with_datatype(datatype)
            }
            "dimension" => {
                let field = config
                    .field
                    .as_deref()
                    .ok_or_else(|| missing("field", &kind))?;
                let mut ingredient = if config.buckets.is_empty() {
                    let (expr, datatype) = self.parse_field(
                        field,
                        &ParseOptions {
                            forbid_aggregation: true,
                            ..Default::default()
                        },
                    )?;
                    Ingredient::dimension(expr).with_datatype(datatype)
                } else {
                    let (value_expr, datatype, order_expr) = self.build_buckets(
                        field,
                        &config.buckets,
                        config.buckets_default_label.as_ref(),
                    )?;
                    Ingredient::dimension(value_expr)
                        .with_datatype(Some(datatype))
                        .with_role("order_by", order_expr, Some(Datatype::Num))?
                };
                // {role}_field keys add further role expressions.
                for (key, value) in &config.extra {
                    if let Some(role) = key.strip_suffix("_field") {
                        let text = value.as_str().ok_or_else(|| {
                            BadIngredient::InvalidConfig(format!("{key} must be a string"))
                        })?;
                        let (expr, datatype) = self.parse_field(
                            text,
                            &ParseOptions {
                                forbid_aggregation: true,
                                ..Default::default()
                            },
                        )?;
                        ingredient = ingredient.with_role(role, expr, datatype)?;
                    }
                }
                if let Some(lookup) = &config.lookup {
                    let pairs = lookup_pairs(lookup);
                    let default = config.lookup_default.as_ref().and_then(Value::from_json);
                    ingredient = ingredient.with_lookup(pairs, default);
                }
                ingredient
            }
            "filter" => {
                let condition = config
                    .condition
                    .as_deref()
                    .ok_or_else(|| missing("condition", &kind))?;
                let expr = self.parse_condition(condition, None)?;
                Ingredient::filter(expr)
            }
            "having" => {
                let condition = config
                    .condition
                    .as_deref()
                    .ok_or_else(|| missing("condition", &kind))?;
                let (expr, _) = self.parse_field(condition, &ParseOptions::default())?;
                if !expr.contains_aggregation() {
                    return Err(BadIngredient::InvalidConfig(
                        "a having condition must contain an aggregation".to_string(),
                    ));
                }
                Ingredient::having(expr)
            }
            other => return Err(BadIngredient::UnknownKind(other.to_string())),
        };

        // Quickselects compile against the ingredient's own field.
        if !config.quickselects.is_empty() {
            let subject = config.field.clone();
            let mut named = Vec::new();
            for qs in &config.quickselects {
                named.push(NamedFilter {
                    name: qs.name.clone(),
                    condition: self.parse_condition(&qs.condition, subject.as_deref())?,
                });
            }
            ingredient = ingredient.with_quickselects(named);
        }

        if let Some(format) = &config.format {
            ingredient =
                ingredient.with_meta("format", Json::String(coerce_format(format).to_string()));
        }
        if let Some(pattern) = &config.anonymizer {
            ingredient = ingredient.with_anonymizer(AnonymizerSpec::Pattern(pattern.clone()));
        }
        for (key, value) in &config.extra {
            if !key.ends_with("_field") {
                ingredient = ingredient.with_meta(key.clone(), value.clone());
            }
        }
        Ok(ingredient)
    }

    /// Lower buckets into an IF chain plus a positional ordering
    /// expression so downstream ORDER BY follows bucket order rather
    /// than label collation.
    fn build_buckets(
        &mut self,
        field: &str,
        buckets: &[BucketConfig],
        default_label: Option<&Json>,
    ) -> Result<(SqlExpr, Datatype, SqlExpr), BadIngredient> {
        let mut value_whens = Vec::new();
        let mut order_whens = Vec::new();
        let mut datatype = Datatype::Str;
        for (idx, bucket) in buckets.iter().enumerate() {
            let condition = self.parse_condition(&bucket.condition, Some(field))?;
            let label = Value::from_json(&bucket.label).ok_or_else(|| {
                BadIngredient::InvalidConfig("bucket labels must be scalars".to_string())
            })?;
            if idx == 0 {
                datatype = label.datatype().unwrap_or(Datatype::Str);
            }
            value_whens.push((condition.clone(), SqlExpr::Literal(label)));
            order_whens.push((condition, SqlExpr::literal(idx as f64)));
        }
        let default = default_label
            .and_then(Value::from_json)
            .unwrap_or_else(|| Value::Str(DEFAULT_BUCKET_LABEL.to_string()));
        let value_expr = SqlExpr::Case {
            whens: value_whens,
            else_: Some(Box::new(SqlExpr::Literal(default))),
        };
        let order_expr = SqlExpr::Case {
            whens: order_whens,
            else_: Some(Box::new(SqlExpr::literal(DEFAULT_BUCKET_ORDER))),
        };
        Ok((value_expr, datatype, order_expr))
    }

    // ---- v1: structured trees ----

    fn build_structured(
        &mut self,
        key: &str,
        value: &Json,
        field_trees: &HashMap<String, FieldTree>,
    ) -> Result<Ingredient, BadIngredient> {
        let obj = value.as_object().ok_or_else(|| {
            BadIngredient::InvalidConfig(format!("ingredient {key} must be a mapping"))
        })?;
        let kind = obj
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("Metric")
            .to_string();

        let field_for = |name: &str| -> Result<FieldTree, BadIngredient> {
            let raw = obj.get(name).ok_or_else(|| missing(name, &kind))?;
            resolve_refs(&coerce_field(raw)?, field_trees, &mut HashSet::new())
        };

        let mut ingredient = match kind.as_str() {
            "Metric" => {
                let tree = field_for("field")?;
                let (expr, datatype) = self.lower_v1_field(&tree, true)?;
                let (expr, datatype) = match obj.get("divide_by") {
                    Some(divide_by) => {
                        let denom_tree = resolve_refs(
                            &coerce_field(divide_by)?,
                            field_trees,
                            &mut HashSet::new(),
                        )?;
                        let (denom, _) = self.lower_v1_field(&denom_tree, true)?;
                        let divided = safe_divide(expr, denom)
                            .map_err(|m| BadIngredient::Compile(GrammarError::message(m)))?;
                        (divided, Some(Datatype::Num))
                    }
                    None => (expr, datatype),
                };
                Ingredient::metric(expr).with_datatype(datatype)
            }
            "DivideMetric" => {
                let num_tree = field_for("numerator_field")?;
                let denom_tree = field_for("denominator_field")?;
                let (num, _) = self.lower_v1_field(&num_tree, true)?;
                let (denom, _) = self.lower_v1_field(&denom_tree, true)?;
                let expr = safe_divide(num, denom)
                    .map_err(|m| BadIngredient::Compile(GrammarError::message(m)))?;
                Ingredient::metric(expr).with_datatype(Some(Datatype::Num))
            }
            "WtdAvgMetric" => {
                let field_tree = field_for("field")?;
                let weight_tree = field_for("weight")?;
                let (field, _) = self.lower_v1_field(&field_tree, false)?;
                let (weight, _) = self.lower_v1_field(&weight_tree, false)?;
                let numerator = SqlExpr::func(
                    "sum",
                    vec![SqlExpr::Binary {
                        op: BinaryOp::Mul,
                        left: Box::new(field),
                        right: Box::new(weight.clone()),
                    }],
                );
                let denominator = SqlExpr::func("sum", vec![weight]);
                let expr = safe_divide(numerator, denominator)
                    .map_err(|m| BadIngredient::Compile(GrammarError::message(m)))?;
                Ingredient::metric(expr).with_datatype(Some(Datatype::Num))
            }
            "Dimension" | "LookupDimension" | "IdValueDimension" => {
                let buckets = obj.get("buckets").and_then(|b| b.as_array());
                let mut ingredient = match buckets {
                    Some(buckets) if !buckets.is_empty() => {
                        let (value_expr, datatype, order_expr) = self.build_v1_buckets(
                            &field_for("field")?,
                            buckets,
                            obj.get("buckets_default_label"),
                            field_trees,
                        )?;
                        Ingredient::dimension(value_expr)
                            .with_datatype(Some(datatype))
                            .with_role("order_by", order_expr, Some(Datatype::Num))?
                    }
                    _ => {
                        let tree = field_for("field")?;
                        let (expr, datatype) = self.lower_v1_field(&tree, false)?;
                        Ingredient::dimension(expr).with_datatype(datatype)
                    }
                };
                if kind == "IdValueDimension" {
                    let tree = field_for("id_field")?;
                    let (expr, datatype) = self.lower_v1_field(&tree, false)?;
                    ingredient = ingredient.with_role("id", expr, datatype)?;
                }
                // Extra roles arrive as `{role}_field` keys.
                for (extra_key, extra_value) in obj {
                    if let Some(role) = extra_key.strip_suffix("_field")
                        && !role.is_empty()
                        && !(kind == "IdValueDimension" && role == "id")
                    {
                        let tree = resolve_refs(
                            &coerce_field(extra_value)?,
                            field_trees,
                            &mut HashSet::new(),
                        )?;
                        let (expr, datatype) = self.lower_v1_field(&tree, false)?;
                        ingredient = ingredient.with_role(role, expr, datatype)?;
                    }
                }
                if let Some(lookup) = obj.get("lookup") {
                    let map = lookup.as_object().ok_or(BadIngredient::InvalidLookup)?;
                    let default = obj.get("lookup_default").and_then(Value::from_json);
                    ingredient = ingredient.with_lookup(lookup_pairs(map), default);
                } else if kind == "LookupDimension" {
                    return Err(missing("lookup", &kind));
                }
                ingredient
            }
            "Filter" => {
                let condition = obj
                    .get("condition")
                    .ok_or_else(|| missing("condition", &kind))?;
                let expr = self.lower_v1_condition(condition, field_trees, false)?;
                Ingredient::filter(expr)
            }
            "Having" => {
                let condition = obj
                    .get("condition")
                    .ok_or_else(|| missing("condition", &kind))?;
                let expr = self.lower_v1_condition(condition, field_trees, true)?;
                Ingredient::having(expr)
            }
            other => return Err(BadIngredient::UnknownKind(other.to_string())),
        };

        if let Some(format) = obj.get("format").and_then(|f| f.as_str()) {
            ingredient =
                ingredient.with_meta("format", Json::String(coerce_format(format).to_string()));
        }
        if let Some(pattern) = obj.get("anonymizer").and_then(|a| a.as_str()) {
            ingredient = ingredient.with_anonymizer(AnonymizerSpec::Pattern(pattern.to_string()));
        }
        const HANDLED: &[&str] = &[
            "kind",
            "field",
            "divide_by",
            "weight",
            "condition",
            "buckets",
            "buckets_default_label",
            "lookup",
            "lookup_default",
            "format",
            "anonymizer",
        ];
        for (extra_key, extra_value) in obj {
            if !HANDLED.contains(&extra_key.as_str()) && !extra_key.ends_with("_field") {
                ingredient = ingredient.with_meta(extra_key.clone(), extra_value.clone());
            }
        }
        Ok(ingredient)
    }

    fn build_v1_buckets(
        &mut self,
        field: &FieldTree,
        buckets: &[Json],
        default_label: Option<&Json>,
        field_trees: &HashMap<String, FieldTree>,
    ) -> Result<(SqlExpr, Datatype, SqlExpr), BadIngredient> {
        let (field_expr, field_datatype) = self.lower_v1_field(field, false)?;
        let mut value_whens = Vec::new();
        let mut order_whens = Vec::new();
        let mut datatype = Datatype::Str;
        for (idx, bucket) in buckets.iter().enumerate() {
            let obj = bucket.as_object().ok_or_else(|| {
                BadIngredient::InvalidConfig("buckets must be a list of mappings".to_string())
            })?;
            let label = obj.get("label").and_then(Value::from_json).ok_or_else(|| {
                BadIngredient::InvalidConfig("bucket labels must be scalars".to_string())
            })?;
            let condition = obj
                .get("condition")
                .ok_or_else(|| missing("condition", "bucket"))?;
            let condition = self.lower_v1_bucket_condition(
                condition,
                field_trees,
                &field_expr,
                field_datatype,
            )?;
            if idx == 0 {
                datatype = label.datatype().unwrap_or(Datatype::Str);
            }
            value_whens.push((condition.clone(), SqlExpr::Literal(label)));
            order_whens.push((condition, SqlExpr::literal(idx as f64)));
        }
        let default = default_label
            .and_then(Value::from_json)
            .unwrap_or_else(|| Value::Str(DEFAULT_BUCKET_LABEL.to_string()));
        Ok((
            SqlExpr::Case {
                whens: value_whens,
                else_: Some(Box::new(SqlExpr::Literal(default))),
            },
            datatype,
            SqlExpr::Case {
                whens: order_whens,
                else_: Some(Box::new(SqlExpr::literal(DEFAULT_BUCKET_ORDER))),
            },
        ))
    }

    /// A bucket condition may omit its field, applying to the
    /// dimension's own field expression.
    fn lower_v1_bucket_condition(
        &mut self,
        condition: &Json,
        field_trees: &HashMap<String, FieldTree>,
        subject: &SqlExpr,
        subject_datatype: Option<Datatype>,
    ) -> Result<SqlExpr, BadIngredient> {
        let obj = condition.as_object().ok_or_else(|| {
            BadIngredient::InvalidConfig("condition must be a mapping".to_string())
        })?;
        if obj.contains_key("field") {
            return self.lower_v1_condition(condition, field_trees, false);
        }
        self.apply_v1_operator(obj, subject.clone(), subject_datatype)
    }

    fn lower_v1_condition(
        &mut self,
        condition: &Json,
        field_trees: &HashMap<String, FieldTree>,
        aggregated: bool,
    ) -> Result<SqlExpr, BadIngredient> {
        let obj = condition.as_object().ok_or_else(|| {
            BadIngredient::InvalidConfig("condition must be a mapping".to_string())
        })?;
        let field = obj.get("field").ok_or_else(|| {
            BadIngredient::InvalidConfig("field must be defined in condition".to_string())
        })?;
        let tree = resolve_refs(&coerce_field(field)?, field_trees, &mut HashSet::new())?;
        let (expr, datatype) = self.lower_v1_field(&tree, aggregated)?;
        self.apply_v1_operator(obj, expr, datatype)
    }

    fn apply_v1_operator(
        &mut self,
        obj: &serde_json::Map<String, Json>,
        expr: SqlExpr,
        datatype: Option<Datatype>,
    ) -> Result<SqlExpr, BadIngredient> {
        let coerce = |v: &Json| -> Result<Value, BadIngredient> {
            let value = Value::from_json(v).ok_or_else(|| {
                BadIngredient::InvalidConfig("conditional value must be a scalar".to_string())
            })?;
            Ok(coerce_to_datatype(datatype, value))
        };

        for (op, cmp) in [
            ("gt", CompareOp::Gt),
            ("gte", CompareOp::Gte),
            ("lt", CompareOp::Lt),
            ("lte", CompareOp::Lte),
            ("eq", CompareOp::Eq),
            ("ne", CompareOp::Ne),
        ] {
            if let Some(v) = obj.get(op) {
                if v.is_array() || v.is_object() {
                    return Err(BadIngredient::InvalidConfig(
                        "conditional value must be a scalar".to_string(),
                    ));
                }
                return Ok(SqlExpr::Compare {
                    op: cmp,
                    left: Box::new(expr),
                    right: Box::new(SqlExpr::Literal(coerce(v)?)),
                });
            }
        }

        for (op, negated) in [("in", false), ("notin", true)] {
            if let Some(v) = obj.get(op) {
                let items = v.as_array().ok_or_else(|| {
                    BadIngredient::InvalidConfig(format!("value for {op} must be a list"))
                })?;
                let list = items
                    .iter()
                    .map(|i| coerce(i).map(SqlExpr::Literal))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(SqlExpr::InList {
                    expr: Box::new(expr),
                    list,
                    negated,
                });
            }
        }

        if let Some(v) = obj.get("between") {
            let items = v.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                BadIngredient::InvalidConfig("between requires a two item list".to_string())
            })?;
            return Ok(SqlExpr::Between {
                expr: Box::new(expr),
                low: Box::new(SqlExpr::Literal(coerce(&items[0])?)),
                high: Box::new(SqlExpr::Literal(coerce(&items[1])?)),
            });
        }

        for (op, case_insensitive) in [("like", false), ("ilike", true)] {
            if let Some(v) = obj.get(op) {
                let pattern = v.as_str().ok_or_else(|| {
                    BadIngredient::InvalidConfig(format!("{op} requires a string"))
                })?;
                return Ok(SqlExpr::Like {
                    expr: Box::new(expr),
                    pattern: Box::new(SqlExpr::literal(pattern)),
                    case_insensitive,
                });
            }
        }

        Err(BadIngredient::InvalidConfig("Bad condition".to_string()))
    }

    /// Lower a resolved v1 field tree to a backend expression.
    fn lower_v1_field(
        &mut self,
        tree: &FieldTree,
        aggregated: bool,
    ) -> Result<(SqlExpr, Option<Datatype>), BadIngredient> {
        let (mut expr, mut datatype) = match &tree.value {
            FieldSource::Column(name) => {
                let col = self.builder.find_column(name).ok_or_else(|| {
                    BadIngredient::InvalidConfig(format!(
                        "{name} is not a field on this selectable"
                    ))
                })?;
                (col.lower(), Some(col.datatype))
            }
            FieldSource::Number(n) => (SqlExpr::literal(*n), Some(Datatype::Num)),
            FieldSource::Ref(name) => {
                return Err(BadIngredient::UnknownReference(name.clone()));
            }
        };

        for (op, other) in &tree.operators {
            let (rhs, rhs_datatype) = self.lower_v1_field(other, false)?;
            match op {
                '+' => {
                    let concat =
                        datatype == Some(Datatype::Str) || rhs_datatype == Some(Datatype::Str);
                    expr = SqlExpr::Binary {
                        op: if concat { BinaryOp::Concat } else { BinaryOp::Add },
                        left: Box::new(expr),
                        right: Box::new(rhs),
                    };
                    if !concat {
                        datatype = Some(Datatype::Num);
                    }
                }
                '-' | '*' => {
                    expr = SqlExpr::Binary {
                        op: if *op == '-' { BinaryOp::Sub } else { BinaryOp::Mul },
                        left: Box::new(expr),
                        right: Box::new(rhs),
                    };
                    datatype = Some(Datatype::Num);
                }
                '/' => {
                    expr = safe_divide(expr, rhs)
                        .map_err(|m| BadIngredient::Compile(GrammarError::message(m)))?;
                    datatype = Some(Datatype::Num);
                }
                other => {
                    return Err(BadIngredient::InvalidConfig(format!(
                        "Unknown operator {other}"
                    )));
                }
            }
        }

        if let Some(condition) = &tree.condition {
            let (cond_expr, cond_datatype) = self.lower_v1_field(&condition.field, false)?;
            let cond = self.apply_v1_operator(&condition.operator, cond_expr, cond_datatype)?;
            expr = SqlExpr::Case {
                whens: vec![(cond, expr)],
                else_: None,
            };
        }

        // The aggregation defaults to sum on aggregated fields and
        // none otherwise.
        let aggregation = tree
            .aggregation
            .clone()
            .or_else(|| aggregated.then(|| "sum".to_string()));
        if let Some(aggregation) = aggregation {
            let (aggregated_expr, aggregated_datatype) =
                self.apply_aggregation(&aggregation, expr, datatype)?;
            expr = aggregated_expr;
            datatype = aggregated_datatype;
        }

        if let Some(cast_to) = &tree.cast_to {
            let (cast, cast_datatype) = cast_target(cast_to)?;
            expr = SqlExpr::Cast {
                expr: Box::new(expr),
                to: cast,
            };
            datatype = Some(cast_datatype);
        }

        if let Some(default) = &tree.default {
            expr = SqlExpr::func("coalesce", vec![expr, SqlExpr::Literal(default.clone())]);
        }

        Ok((expr, datatype))
    }

    fn apply_aggregation(
        &self,
        name: &str,
        expr: SqlExpr,
        datatype: Option<Datatype>,
    ) -> Result<(SqlExpr, Option<Datatype>), BadIngredient> {
        let bad = |m: String| BadIngredient::Compile(GrammarError::message(m));
        let result = match name {
            "none" => (expr, datatype),
            "sum" | "avg" => (SqlExpr::func(name, vec![expr]), Some(Datatype::Num)),
            "min" | "max" => (SqlExpr::func(name, vec![expr]), datatype),
            "count" => (SqlExpr::func("count", vec![expr]), Some(Datatype::Num)),
            "count_distinct" => (SqlExpr::CountDistinct(Box::new(expr)), Some(Datatype::Num)),
            "month" | "week" | "year" | "quarter" => {
                let is_datetime = datatype == Some(Datatype::Datetime);
                (
                    truncate_to_unit(self.dialect, name, expr, is_datetime).map_err(bad)?,
                    Some(Datatype::Date),
                )
            }
            "age" => {
                if self.dialect == Dialect::Sqlite {
                    return Err(bad("Age is not supported on sqlite".to_string()));
                }
                (SqlExpr::Age(Box::new(expr)), Some(Datatype::Num))
            }
            "median" => {
                let lowered = if self.dialect == Dialect::Bigquery {
                    SqlExpr::ApproxQuantiles {
                        expr: Box::new(expr),
                        buckets: 2,
                        offset: 1,
                    }
                } else {
                    SqlExpr::func("median", vec![expr])
                };
                (lowered, Some(Datatype::Num))
            }
            other => match crate::expression::ast::percentile_level(other) {
                Some(level) => {
                    if self.dialect == Dialect::Sqlite {
                        return Err(bad("Percentile is not supported on sqlite".to_string()));
                    }
                    let lowered = if self.dialect == Dialect::Bigquery {
                        let (buckets, offset) = approx_quantile_params(level);
                        SqlExpr::ApproxQuantiles {
                            expr: Box::new(expr),
                            buckets,
                            offset,
                        }
                    } else {
                        SqlExpr::PercentileCont {
                            fraction: level as f64 / 100.0,
                            expr: Box::new(expr),
                        }
                    };
                    (lowered, Some(Datatype::Num))
                }
                None => {
                    return Err(BadIngredient::InvalidConfig(format!(
                        "unknown aggregation {other}"
                    )));
                }
            },
        };
        Ok(result)
    }
}

fn missing(key: &str, kind: &str) -> BadIngredient {
    BadIngredient::MissingKey {
        key: key.to_string(),
        kind: kind.to_string(),
    }
}

fn lookup_pairs(map: &serde_json::Map<String, Json>) -> Vec<(Value, Value)> {
    let mut pairs = Vec::new();
    for (k, v) in map {
        let Some(mapped) = Value::from_json(v) else {
            continue;
        };
        // JSON keys are strings; when the key spells a number, match
        // numeric row values too.
        if let Ok(n) = k.parse::<f64>() {
            pairs.push((Value::Num(n), mapped.clone()));
        }
        pairs.push((Value::Str(k.clone()), mapped));
    }
    pairs
}

fn coerce_to_datatype(datatype: Option<Datatype>, value: Value) -> Value {
    match (datatype, &value) {
        (Some(Datatype::Date), Value::Str(s)) => crate::expression::dates::parse_human_date(s)
            .map(|dt| Value::Date(dt.date()))
            .unwrap_or(value),
        (Some(Datatype::Datetime), Value::Str(s)) => {
            crate::expression::dates::parse_human_date(s)
                .map(Value::Datetime)
                .unwrap_or(value)
        }
        _ => value,
    }
}

fn cast_target(name: &str) -> Result<(CastType, Datatype), BadIngredient> {
    match name.to_lowercase().as_str() {
        "str" | "string" | "text" | "varchar" => Ok((CastType::Text, Datatype::Str)),
        "int" | "integer" => Ok((CastType::Integer, Datatype::Num)),
        "num" | "float" | "decimal" => Ok((CastType::Float, Datatype::Num)),
        "date" => Ok((CastType::Date, Datatype::Date)),
        "datetime" | "timestamp" => Ok((CastType::Timestamp, Datatype::Datetime)),
        "bool" | "boolean" => Ok((CastType::Boolean, Datatype::Bool)),
        other => Err(BadIngredient::InvalidConfig(format!(
            "can not cast to {other}"
        ))),
    }
}

// ---- v1 field trees ----

#[derive(Debug, Clone, PartialEq)]
enum FieldSource {
    Column(String),
    Number(f64),
    /// `@name` cross-ingredient reference, resolved before lowering.
    Ref(String),
}

#[derive(Debug, Clone, PartialEq)]
struct FieldTree {
    value: FieldSource,
    aggregation: Option<String>,
    operators: Vec<(char, FieldTree)>,
    condition: Option<Box<ConditionTree>>,
    cast_to: Option<String>,
    default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct ConditionTree {
    field: FieldTree,
    operator: serde_json::Map<String, Json>,
}

impl FieldTree {
    fn leaf(value: FieldSource) -> FieldTree {
        FieldTree {
            value,
            aggregation: None,
            operators: Vec::new(),
            condition: None,
            cast_to: None,
            default: None,
        }
    }
}

const V1_AGGREGATIONS: &[&str] = &[
    "sum",
    "min",
    "max",
    "avg",
    "count",
    "count_distinct",
    "month",
    "week",
    "year",
    "quarter",
    "age",
    "median",
    "none",
];

fn is_v1_aggregation(name: &str) -> bool {
    V1_AGGREGATIONS.contains(&name) || crate::expression::ast::percentile_level(name).is_some()
}

/// Normalize a field config value (string shorthand or structured
/// mapping) into a field tree.
fn coerce_field(value: &Json) -> Result<FieldTree, BadIngredient> {
    match value {
        Json::String(s) => coerce_field_string(s, true),
        Json::Number(n) => Ok(FieldTree::leaf(FieldSource::Number(
            n.as_f64().unwrap_or(0.0),
        ))),
        Json::Object(obj) => coerce_field_object(obj),
        _ => Err(BadIngredient::InvalidConfig(
            "fields must be a string or a mapping".to_string(),
        )),
    }
}

/// The `aggr(inner)` shorthand, if this string is one.
fn functional_form(s: &str) -> Option<(&str, &str)> {
    let open = s.find('(')?;
    if !s.ends_with(')') {
        return None;
    }
    let aggr = &s[..open];
    is_v1_aggregation(aggr).then(|| (aggr, &s[open + 1..s.len() - 1]))
}

/// Normalize string shorthand like `"sum(a)+b"` into the structured
/// shape: value `a`, aggregation `sum`, operators `[(+, b)]`.
fn coerce_field_string(s: &str, search_for_operators: bool) -> Result<FieldTree, BadIngredient> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err(BadIngredient::InvalidConfig(
            "fields must contain a value".to_string(),
        ));
    }

    if let Some(rest) = s.strip_prefix('@') {
        let mut tree = coerce_field_string(rest, search_for_operators)?;
        if let FieldSource::Column(name) = &tree.value {
            tree.value = FieldSource::Ref(name.clone());
        }
        return Ok(tree);
    }

    // A functional form wrapping everything: aggr(inner).
    if let Some((aggr, inner)) = functional_form(&s) {
        let mut tree = coerce_field_string(inner, search_for_operators)?;
        tree.aggregation = Some(aggr.to_string());
        return Ok(tree);
    }

    let (head, operators) = if search_for_operators {
        split_operators(&s)?
    } else {
        (s.clone(), Vec::new())
    };

    let mut tree = if let Ok(n) = head.parse::<f64>() {
        FieldTree::leaf(FieldSource::Number(n))
    } else if functional_form(&head).is_some() {
        // A functional head like the `sum(a)` of `sum(a)+b`.
        coerce_field_string(&head, false)?
    } else if head.contains('(') {
        return Err(BadIngredient::InvalidConfig(format!(
            "{head} is not a valid field"
        )));
    } else if let Some(rest) = head.strip_prefix('@') {
        FieldTree::leaf(FieldSource::Ref(rest.to_string()))
    } else {
        FieldTree::leaf(FieldSource::Column(head))
    };
    tree.operators.extend(operators);
    Ok(tree)
}

/// Split `"a+b-c"` into a head field and trailing operator entries.
fn split_operators(s: &str) -> Result<(String, Vec<(char, FieldTree)>), BadIngredient> {
    let mut parts: Vec<(Option<char>, String)> = vec![(None, String::new())];
    for c in s.chars() {
        if matches!(c, '+' | '-' | '*' | '/') {
            parts.push((Some(c), String::new()));
        } else {
            parts.last_mut().expect("nonempty").1.push(c);
        }
    }
    let mut iter = parts.into_iter();
    let head = iter.next().expect("nonempty").1;
    let mut operators = Vec::new();
    for (op, text) in iter {
        let op = op.expect("operator recorded");
        if text.is_empty() {
            return Err(BadIngredient::InvalidConfig(
                "field does not have the right number of parts".to_string(),
            ));
        }
        operators.push((op, coerce_field_string(&text, false)?));
    }
    Ok((head, operators))
}

fn coerce_field_object(obj: &serde_json::Map<String, Json>) -> Result<FieldTree, BadIngredient> {
    let value = obj
        .get("value")
        .ok_or_else(|| BadIngredient::InvalidConfig("fields must contain a value".to_string()))?;
    let mut tree = match value {
        Json::String(s) => coerce_field_string(s, true)?,
        Json::Number(n) => FieldTree::leaf(FieldSource::Number(n.as_f64().unwrap_or(0.0))),
        _ => {
            return Err(BadIngredient::InvalidConfig(
                "field value must be a string".to_string(),
            ));
        }
    };

    if let Some(ref_name) = obj.get("ref").and_then(|r| r.as_str()) {
        tree.value = FieldSource::Ref(ref_name.to_string());
    }

    if let Some(aggregation) = obj.get("aggregation") {
        match aggregation {
            Json::Null => {}
            Json::String(name) if is_v1_aggregation(name) => {
                tree.aggregation = Some(name.clone());
            }
            Json::String(name) => {
                return Err(BadIngredient::InvalidConfig(format!(
                    "unknown aggregation {name}"
                )));
            }
            _ => {
                return Err(BadIngredient::InvalidConfig(
                    "aggregation must be null or a string".to_string(),
                ));
            }
        }
    }

    if let Some(operators) = obj.get("operators") {
        let items = operators
            .as_array()
            .ok_or_else(|| BadIngredient::InvalidConfig("operators must be a list".to_string()))?;
        for item in items {
            let entry = item.as_object().ok_or_else(|| {
                BadIngredient::InvalidConfig("operators must be mappings".to_string())
            })?;
            let op = entry
                .get("operator")
                .and_then(|o| o.as_str())
                .and_then(|o| o.chars().next())
                .ok_or_else(|| {
                    BadIngredient::InvalidConfig("operator entries need an operator".to_string())
                })?;
            let field = entry.get("field").ok_or_else(|| {
                BadIngredient::InvalidConfig("operator entries need a field".to_string())
            })?;
            tree.operators.push((op, coerce_field(field)?));
        }
    }

    if let Some(condition) = obj.get("condition")
        && !condition.is_null()
    {
        let cond_obj = condition.as_object().ok_or_else(|| {
            BadIngredient::InvalidConfig("condition must be null or an object".to_string())
        })?;
        let field = cond_obj.get("field").ok_or_else(|| {
            BadIngredient::InvalidConfig("field must be defined in condition".to_string())
        })?;
        let mut operator = cond_obj.clone();
        operator.remove("field");
        tree.condition = Some(Box::new(ConditionTree {
            field: coerce_field(field)?,
            operator,
        }));
    }

    if let Some(cast_to) = obj.get("as").and_then(|a| a.as_str()) {
        tree.cast_to = Some(cast_to.to_string());
    }
    if let Some(default) = obj.get("default").and_then(Value::from_json) {
        tree.default = Some(default);
    }

    Ok(tree)
}

/// Primary field trees for every v1 ingredient, used for `@ref`
/// substitution.
fn collect_v1_field_trees(obj: &serde_json::Map<String, Json>) -> HashMap<String, FieldTree> {
    let mut trees = HashMap::new();
    for (key, value) in obj {
        if key == "_version" {
            continue;
        }
        if let Some(field) = value.get("field")
            && let Ok(tree) = coerce_field(field)
        {
            trees.insert(key.clone(), tree);
        }
    }
    trees
}

/// Substitute `@name` references with the referent's field tree.
/// References form a DAG; cycles are reported as configuration errors.
fn resolve_refs(
    tree: &FieldTree,
    field_trees: &HashMap<String, FieldTree>,
    visiting: &mut HashSet<String>,
) -> Result<FieldTree, BadIngredient> {
    let mut resolved = tree.clone();

    if let FieldSource::Ref(name) = &tree.value {
        // A ref that names no ingredient may still be a namespaced
        // column (e.g. `@constants.ttlpop`); leave it for the column
        // lookup in that case.
        if let Some(referent) = field_trees.get(name) {
            if !visiting.insert(name.clone()) {
                return Err(BadIngredient::ReferenceCycle(name.clone()));
            }
            let referent = resolve_refs(referent, field_trees, visiting)?;
            visiting.remove(name);
            // Graft the referent tree, keeping this node's own
            // modifiers layered on top.
            resolved.value = referent.value;
            if resolved.aggregation.is_none() {
                resolved.aggregation = referent.aggregation;
            }
            let mut operators = referent.operators;
            operators.extend(resolved.operators);
            resolved.operators = operators;
            if resolved.condition.is_none() {
                resolved.condition = referent.condition;
            }
        } else if name.contains('.') {
            resolved.value = FieldSource::Column(name.clone());
        } else {
            return Err(BadIngredient::UnknownReference(name.clone()));
        }
    }

    resolved.operators = resolved
        .operators
        .iter()
        .map(|(op, sub)| Ok((*op, resolve_refs(sub, field_trees, visiting)?)))
        .collect::<Result<Vec<_>, BadIngredient>>()?;

    if let Some(condition) = &resolved.condition {
        resolved.condition = Some(Box::new(ConditionTree {
            field: resolve_refs(&condition.field, field_trees, visiting)?,
            operator: condition.operator.clone(),
        }));
    }

    Ok(resolved)
}

/// Convenience constructor: build a shelf over one selectable.
pub fn shelf_from_config(
    tree: &Json,
    selectable: &Selectable,
    drivername: &str,
) -> Result<Shelf, BadIngredient> {
    ShelfLoader::new(selectable, drivername)?.load(tree)
}

/// Convenience constructor with builder options (cache, constants,
/// extra selectables, reference date).
pub fn shelf_from_config_with(
    tree: &Json,
    selectable: &Selectable,
    drivername: &str,
    config: BuilderConfig,
) -> Result<Shelf, BadIngredient> {
    ShelfLoader::with_config(selectable, drivername, config)?.load(tree)
}
