//! Automatic generation and addition of filters to a recipe.
//!
//! Accepts maps of `{key: value_or_list}`. Key syntax is
//! `dim[,dim2,...][__operator]`: plain keys filter one dimension,
//! compound keys produce a disjunction of conjunctions, and the
//! operator suffix selects the comparison. Values may arrive
//! JSON-encoded for structured delivery.

use std::any::Any;

use serde_json::Value as Json;

use crate::datatype::Value;
use crate::error::BadRecipe;
use crate::extensions::{AddIngredientsContext, RecipeExtension};
use crate::ingredient::{FilterValue, Ingredient, IngredientKind};
use crate::sql::{CompareOp, SqlExpr};

/// Operator suffixes accepted after `__` in a filter key.
const OPERATORS: &[&str] = &[
    "eq",
    "ne",
    "lt",
    "lte",
    "gt",
    "gte",
    "is",
    "isnot",
    "like",
    "ilike",
    "in",
    "notin",
    "between",
    "quickselect",
    "or",
    "not",
];

#[derive(Default)]
pub struct AutomaticFilters {
    apply: bool,
    strict: bool,
    filters: Vec<serde_json::Map<String, Json>>,
    include_keys: Option<Vec<String>>,
    exclude_keys: Option<Vec<String>>,
    dirty: bool,
}

impl AutomaticFilters {
    pub fn new() -> AutomaticFilters {
        AutomaticFilters {
            apply: true,
            strict: true,
            filters: Vec::new(),
            include_keys: None,
            exclude_keys: None,
            dirty: false,
        }
    }

    /// Set the automatic filter map.
    pub fn automatic_filters(&mut self, filters: serde_json::Map<String, Json>) -> &mut Self {
        self.filters = vec![filters];
        self.dirty = true;
        self
    }

    /// Add a further filter map; maps accumulate.
    pub fn add_filters(&mut self, filters: serde_json::Map<String, Json>) -> &mut Self {
        self.filters.push(filters);
        self.dirty = true;
        self
    }

    /// Toggle whether automatic filters apply to the recipe.
    pub fn apply_automatic_filters(&mut self, value: bool) -> &mut Self {
        if self.apply != value {
            self.apply = value;
            self.dirty = true;
        }
        self
    }

    /// Unknown keys are rejected when strict (the default) and
    /// silently ignored otherwise.
    pub fn strict_automatic_filters(&mut self, value: bool) -> &mut Self {
        if self.strict != value {
            self.strict = value;
            self.dirty = true;
        }
        self
    }

    /// Only use these keys from the filter maps.
    pub fn include_automatic_filter_keys(&mut self, keys: Vec<String>) -> &mut Self {
        self.include_keys = Some(keys);
        self.dirty = true;
        self
    }

    /// Ignore these keys in the filter maps.
    pub fn exclude_automatic_filter_keys(&mut self, keys: Vec<String>) -> &mut Self {
        self.exclude_keys = Some(keys);
        self.dirty = true;
        self
    }

    fn build_single(
        &self,
        ctx: &AddIngredientsContext<'_>,
        dim: &str,
        operator: Option<&str>,
        value: &Json,
    ) -> Result<Option<SqlExpr>, BadRecipe> {
        let ingredient = match ctx.shelf.find(dim, &[IngredientKind::Dimension]) {
            Ok(ingredient) => ingredient,
            Err(e) => {
                if self.strict {
                    return Err(e);
                }
                return Ok(None);
            }
        };

        // `or`/`not` combine named quickselects.
        if matches!(operator, Some("or") | Some("not")) {
            let names: Vec<String> = match value {
                Json::Array(items) => items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect(),
                Json::String(s) => vec![s.clone()],
                _ => vec![],
            };
            let conditions = names
                .iter()
                .map(|n| ingredient.quickselect_condition(n))
                .collect::<Result<Vec<_>, _>>()?;
            let combined = if conditions.len() == 1 {
                conditions.into_iter().next().expect("one condition")
            } else {
                SqlExpr::Or(conditions)
            };
            let expr = if operator == Some("not") {
                SqlExpr::Not(Box::new(combined))
            } else {
                combined
            };
            return Ok(Some(expr));
        }

        let filter_value = match decode_value(value) {
            Some(v) => v,
            None => return Ok(None),
        };

        // An empty value list matches nothing.
        if matches!(&filter_value, FilterValue::List(items) if items.is_empty()) {
            return Ok(Some(nothing_matches()));
        }

        let expr = ingredient.build_filter_expression(filter_value, operator, None)?;
        Ok(Some(expr))
    }

    /// Compound keys take a list of rows, each aligned with the
    /// dimension list, producing OR-of-ANDs.
    fn build_compound(
        &self,
        ctx: &AddIngredientsContext<'_>,
        dims: &[&str],
        operator: Option<&str>,
        value: &Json,
    ) -> Result<Option<SqlExpr>, BadRecipe> {
        let mut ingredients = Vec::new();
        for dim in dims {
            match ctx.shelf.find(dim, &[IngredientKind::Dimension]) {
                Ok(ingredient) => ingredients.push(ingredient),
                Err(e) => {
                    if self.strict {
                        return Err(e);
                    }
                    return Ok(None);
                }
            }
        }

        let rows = match value {
            Json::Array(rows) => rows,
            _ => return Ok(Some(nothing_matches())),
        };
        if rows.is_empty() {
            return Ok(Some(nothing_matches()));
        }

        let mut disjuncts = Vec::new();
        for row in rows {
            let cells = match row {
                Json::Array(cells) if cells.len() == ingredients.len() => cells,
                _ => continue,
            };
            let mut conjuncts = Vec::new();
            for (ingredient, cell) in ingredients.iter().zip(cells) {
                let scalar = Value::from_json(cell).unwrap_or(Value::Null);
                conjuncts.push(ingredient.build_filter_expression(
                    FilterValue::Scalar(scalar),
                    operator,
                    None,
                )?);
            }
            disjuncts.push(SqlExpr::And(conjuncts));
        }
        if disjuncts.is_empty() {
            return Ok(Some(nothing_matches()));
        }
        Ok(Some(SqlExpr::Or(disjuncts)))
    }
}

impl RecipeExtension for AutomaticFilters {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self.dirty = true;
        self
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn from_config(&mut self, obj: &Json) -> Result<(), BadRecipe> {
        if let Some(filters) = obj.get("automatic_filters") {
            let map = filters
                .as_object()
                .ok_or_else(|| BadRecipe::UnknownDirective("automatic_filters".to_string()))?;
            self.automatic_filters(map.clone());
        }
        if let Some(apply) = obj
            .get("apply_automatic_filters")
            .and_then(|v| v.as_bool())
        {
            self.apply_automatic_filters(apply);
        }
        if let Some(strict) = obj
            .get("strict_automatic_filters")
            .and_then(|v| v.as_bool())
        {
            self.strict_automatic_filters(strict);
        }
        for (key, setter) in [
            (
                "include_automatic_filter_keys",
                Self::include_automatic_filter_keys as fn(&mut Self, Vec<String>) -> &mut Self,
            ),
            (
                "exclude_automatic_filter_keys",
                Self::exclude_automatic_filter_keys,
            ),
        ] {
            if let Some(keys) = obj.get(key).and_then(|v| v.as_array()) {
                let keys = keys
                    .iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect();
                setter(self, keys);
            }
        }
        Ok(())
    }

    fn add_ingredients(&mut self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        if !self.apply {
            return Ok(());
        }
        let mut counter = 0usize;
        for filters in &self.filters {
            for (key, raw_value) in filters {
                let (dims_part, operator) = split_operator(key);
                if let Some(include) = &self.include_keys
                    && !include.iter().any(|k| k == dims_part)
                {
                    continue;
                }
                if let Some(exclude) = &self.exclude_keys
                    && exclude.iter().any(|k| k == dims_part)
                {
                    continue;
                }

                // JSON-encoded values decode to their structured form.
                let decoded;
                let value = match raw_value {
                    Json::String(s) if s.trim_start().starts_with('[') => {
                        match serde_json::from_str::<Json>(s) {
                            Ok(v) => {
                                decoded = v;
                                &decoded
                            }
                            Err(_) => raw_value,
                        }
                    }
                    other => other,
                };

                let dims: Vec<&str> = dims_part.split(',').collect();
                let expr = if dims.len() == 1 {
                    self.build_single(ctx, dims[0], operator, value)?
                } else {
                    self.build_compound(ctx, &dims, operator, value)?
                };
                if let Some(expr) = expr {
                    counter += 1;
                    ctx.cauldron.use_ingredient(
                        Ingredient::filter(expr).with_id(format!("autofilter_{counter}")),
                    );
                }
            }
        }
        Ok(())
    }
}

fn split_operator(key: &str) -> (&str, Option<&str>) {
    if let Some((dims, op)) = key.rsplit_once("__")
        && OPERATORS.contains(&op)
    {
        return (dims, Some(op));
    }
    (key, None)
}

/// The filter emitted for an empty value list: matches no rows.
fn nothing_matches() -> SqlExpr {
    SqlExpr::Compare {
        op: CompareOp::Ne,
        left: Box::new(SqlExpr::literal(1.0)),
        right: Box::new(SqlExpr::literal(1.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingredient::SortOrder;
    use crate::shelf::Shelf;
    use crate::sql::Dialect;
    use serde_json::json;

    fn context_shelves() -> (Shelf, Shelf, Vec<Ingredient>) {
        (crate::test_helpers::census_shelf(), Shelf::new(), Vec::new())
    }

    fn run(filters: Json, strict: bool) -> Result<Vec<String>, BadRecipe> {
        let (shelf, mut cauldron, mut order_bys) = context_shelves();
        let mut ext = AutomaticFilters::new();
        ext.strict_automatic_filters(strict);
        ext.automatic_filters(filters.as_object().unwrap().clone());
        let mut ctx = AddIngredientsContext {
            shelf: &shelf,
            cauldron: &mut cauldron,
            order_bys: &mut order_bys,
        };
        ext.add_ingredients(&mut ctx)?;
        Ok(cauldron
            .values()
            .flat_map(|i| i.filters.iter().map(|f| f.sql(Dialect::Sqlite)))
            .collect())
    }

    #[test]
    fn test_scalar_and_list_filters() {
        let sql = run(json!({"state": "Tennessee"}), true).unwrap();
        assert_eq!(sql, vec!["census.state = 'Tennessee'"]);

        let sql = run(json!({"state": ["Vermont", "Tennessee"]}), true).unwrap();
        assert_eq!(sql, vec!["census.state IN ('Tennessee', 'Vermont')"]);
    }

    #[test]
    fn test_operator_suffixes() {
        let sql = run(json!({"state__lt": "D"}), true).unwrap();
        assert_eq!(sql, vec!["census.state < 'D'"]);

        let sql = run(json!({"state__notin": ["Vermont"]}), true).unwrap();
        assert_eq!(sql, vec!["census.state NOT IN ('Vermont')"]);

        let sql = run(json!({"age__between": [13, 19]}), true).unwrap();
        assert_eq!(sql, vec!["census.age BETWEEN 13 AND 19"]);
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let sql = run(json!({"state": []}), true).unwrap();
        assert_eq!(sql, vec!["1 != 1"]);
    }

    #[test]
    fn test_unknown_key_strictness() {
        let err = run(json!({"mystery": "x"}), true).unwrap_err();
        assert!(matches!(err, BadRecipe::NotOnShelf(_)));

        // Non-strict ignores the key, yielding the same SQL as if the
        // filter had not been supplied.
        let sql = run(json!({"mystery": "x"}), false).unwrap();
        assert!(sql.is_empty());
    }

    #[test]
    fn test_compound_keys() {
        let sql = run(
            json!({"state,sex": [["Tennessee", "M"], ["Vermont", "F"]]}),
            true,
        )
        .unwrap();
        assert_eq!(
            sql,
            vec![
                "((census.state = 'Tennessee') AND (census.sex = 'M')) OR \
                 ((census.state = 'Vermont') AND (census.sex = 'F'))"
            ]
        );
    }

    #[test]
    fn test_json_encoded_values() {
        let direct = run(json!({"state": ["Vermont", "Tennessee"]}), true).unwrap();
        let encoded = run(json!({"state": "[\"Vermont\", \"Tennessee\"]"}), true).unwrap();
        assert_eq!(direct, encoded);
    }

    #[test]
    fn test_include_exclude_keys() {
        let (shelf, mut cauldron, mut order_bys) = context_shelves();
        let mut ext = AutomaticFilters::new();
        ext.automatic_filters(
            json!({"state": "Tennessee", "sex": "M"})
                .as_object()
                .unwrap()
                .clone(),
        );
        ext.include_automatic_filter_keys(vec!["state".to_string()]);
        let mut ctx = AddIngredientsContext {
            shelf: &shelf,
            cauldron: &mut cauldron,
            order_bys: &mut order_bys,
        };
        ext.add_ingredients(&mut ctx).unwrap();
        assert_eq!(cauldron.len(), 1);
    }

    #[test]
    fn test_apply_toggle() {
        let (shelf, mut cauldron, mut order_bys) = context_shelves();
        let mut ext = AutomaticFilters::new();
        ext.automatic_filters(json!({"state": "x"}).as_object().unwrap().clone());
        ext.apply_automatic_filters(false);
        let mut ctx = AddIngredientsContext {
            shelf: &shelf,
            cauldron: &mut cauldron,
            order_bys: &mut order_bys,
        };
        ext.add_ingredients(&mut ctx).unwrap();
        assert!(cauldron.is_empty());
        assert!(order_bys.is_empty());
    }

    #[test]
    fn test_ordering_untouched() {
        // Ingredient ordering flags are irrelevant to this extension.
        let (_, _, order_bys) = context_shelves();
        assert!(order_bys.iter().all(|o| o.ordering == SortOrder::Asc));
    }
}

/// Decode a JSON value into a filter value.
fn decode_value(value: &Json) -> Option<FilterValue> {
    match value {
        Json::Array(items) => Some(FilterValue::List(
            items.iter().map(|i| Value::from_json(i).unwrap_or(Value::Null)).collect(),
        )),
        other => Value::from_json(other).map(FilterValue::Scalar),
    }
}
