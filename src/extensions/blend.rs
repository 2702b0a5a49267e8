//! Blending and comparison of recipes.
//!
//! Both extensions attach a second recipe's statement as a joined
//! subquery. Blend joins on an explicit dimension pair and hoists the
//! other recipe's metrics and non-join dimensions into the base
//! query. Compare outer-joins on the shared dimensions and hoists
//! suffixed, summary-aggregated metrics.

use std::any::Any;

use crate::error::BadRecipe;
use crate::extensions::{AddIngredientsContext, QueryContext, RecipeExtension};
use crate::ingredient::{GroupByStrategy, IngredientKind};
use crate::recipe::Recipe;
use crate::sql::{CompareOp, FromItem, Join, QueryTerm, SelectQuery, SqlExpr};

struct Blend {
    recipe: Recipe,
    outer: bool,
    join_base: String,
    join_blend: String,
}

/// Join data from another selectable to the base recipe.
#[derive(Default)]
pub struct BlendRecipe {
    blends: Vec<Blend>,
    dirty: bool,
}

impl BlendRecipe {
    pub fn new() -> BlendRecipe {
        BlendRecipe::default()
    }

    /// Inner-join a recipe on a shared dimension pair.
    pub fn blend(
        &mut self,
        recipe: Recipe,
        join_base: impl Into<String>,
        join_blend: impl Into<String>,
    ) -> &mut Self {
        self.blends.push(Blend {
            recipe,
            outer: false,
            join_base: join_base.into(),
            join_blend: join_blend.into(),
        });
        self.dirty = true;
        self
    }

    /// Outer-join a recipe, preserving values from both sides.
    pub fn full_blend(
        &mut self,
        recipe: Recipe,
        join_base: impl Into<String>,
        join_blend: impl Into<String>,
    ) -> &mut Self {
        self.blends.push(Blend {
            recipe,
            outer: true,
            join_base: join_base.into(),
            join_blend: join_blend.into(),
        });
        self.dirty = true;
        self
    }
}

/// Joining subqueries produces clashing labels, so every dimension in
/// the cauldron switches to the direct group-by strategy.
fn force_direct_grouping(ctx: &mut AddIngredientsContext<'_>) {
    for ingredient in ctx.cauldron.values_mut() {
        if ingredient.kind == IngredientKind::Dimension {
            ingredient.group_by_strategy = GroupByStrategy::Direct;
        }
    }
}

impl RecipeExtension for BlendRecipe {
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

    fn add_ingredients(&mut self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        if !self.blends.is_empty() {
            force_direct_grouping(ctx);
        }
        Ok(())
    }

    fn modify_postquery_parts(
        &mut self,
        query: &mut SelectQuery,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        for (index, blend) in self.blends.iter_mut().enumerate() {
            let alias = format!("blend_{}", index + 1);
            let blend_query = blend.recipe.query()?;
            let blend_labels = blend_query.column_labels();
            let blend_sql = blend_query.to_sql(ctx.dialect);

            // Hoist every metric from the blend recipe.
            for metric_id in blend.recipe.metric_ids() {
                let metric = blend
                    .recipe
                    .cauldron()
                    .get(&metric_id)
                    .expect("metric listed by the cauldron")
                    .clone();
                for suffix in metric.make_column_suffixes().map_err(BadRecipe::Ingredient)? {
                    let label = format!("{}{suffix}", metric.id);
                    if !blend_labels.contains(&label) {
                        return Err(BadRecipe::BlendColumnMissing(label));
                    }
                    query.add_column(SqlExpr::column(&alias, &label), label);
                }
                ctx.cauldron.use_ingredient(metric);
            }

            // Hoist non-join dimensions, grouping by them directly.
            for dimension_id in blend.recipe.dimension_ids() {
                if dimension_id == blend.join_blend {
                    continue;
                }
                let dimension = blend
                    .recipe
                    .cauldron()
                    .get(&dimension_id)
                    .expect("dimension listed by the cauldron")
                    .clone();
                for suffix in dimension
                    .make_column_suffixes()
                    .map_err(BadRecipe::Ingredient)?
                {
                    let label = format!("{}{suffix}", dimension.id);
                    if !blend_labels.contains(&label) {
                        return Err(BadRecipe::BlendColumnMissing(label));
                    }
                    query.add_column(SqlExpr::column(&alias, &label), label.clone());
                    query
                        .group_by
                        .push(QueryTerm::Expr(SqlExpr::column(&alias, &label)));
                }
                ctx.cauldron.use_ingredient(dimension);
            }

            let base_dim = ctx
                .cauldron
                .get(&blend.join_base)
                .ok_or_else(|| BadRecipe::NotOnShelf(blend.join_base.clone()))?;
            let base_col = base_dim
                .columns
                .first()
                .cloned()
                .ok_or_else(|| BadRecipe::NotOnShelf(blend.join_base.clone()))?;
            let blend_dim = blend
                .recipe
                .cauldron()
                .get(&blend.join_blend)
                .ok_or_else(|| BadRecipe::NotOnShelf(blend.join_blend.clone()))?;
            let join_label = blend_dim.id_prop();
            if !blend_labels.contains(&join_label) {
                return Err(BadRecipe::BlendJoinMissing(join_label));
            }

            query.joins.push(Join {
                outer: blend.outer,
                item: FromItem::Subquery {
                    sql: blend_sql,
                    alias: alias.clone(),
                },
                on: SqlExpr::Compare {
                    op: CompareOp::Eq,
                    left: Box::new(base_col),
                    right: Box::new(SqlExpr::column(&alias, &join_label)),
                },
            });
        }
        Ok(())
    }
}

/// Present comparative context alongside a base recipe.
#[derive(Default)]
pub struct CompareRecipe {
    compares: Vec<(Recipe, String)>,
    dirty: bool,
}

impl CompareRecipe {
    pub fn new() -> CompareRecipe {
        CompareRecipe::default()
    }

    /// Add a comparison recipe with the default `_compare` suffix.
    pub fn compare(&mut self, recipe: Recipe) -> &mut Self {
        self.compare_suffixed(recipe, "_compare")
    }

    pub fn compare_suffixed(&mut self, recipe: Recipe, suffix: impl Into<String>) -> &mut Self {
        self.compares.push((recipe, suffix.into()));
        self.dirty = true;
        self
    }
}

impl RecipeExtension for CompareRecipe {
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

    fn add_ingredients(&mut self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        if !self.compares.is_empty() {
            force_direct_grouping(ctx);
        }
        Ok(())
    }

    fn modify_postquery_parts(
        &mut self,
        query: &mut SelectQuery,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        for (index, (compare, suffix)) in self.compares.iter_mut().enumerate() {
            let alias = format!("compare_{}", index + 1);
            let compare_query = compare.query()?;
            let compare_labels = compare_query.column_labels();
            let compare_sql = compare_query.to_sql(ctx.dialect);

            // Hoisted comparison metrics need an aggregation; avg is
            // the default unless the metric specifies one.
            for metric_id in compare.metric_ids() {
                let mut metric = compare
                    .cauldron()
                    .get(&metric_id)
                    .expect("metric listed by the cauldron")
                    .clone();
                let aggregation = metric
                    .meta
                    .get("summary_aggregation")
                    .and_then(|v| v.as_str())
                    .unwrap_or("avg")
                    .to_string();
                let renamed = format!("{}{suffix}", metric.id);
                for col_suffix in
                    metric.make_column_suffixes().map_err(BadRecipe::Ingredient)?
                {
                    let source = format!("{metric_id}{col_suffix}");
                    if !compare_labels.contains(&source) {
                        return Err(BadRecipe::BlendColumnMissing(source));
                    }
                    query.add_column(
                        SqlExpr::func(
                            aggregation.clone(),
                            vec![SqlExpr::column(&alias, &source)],
                        ),
                        format!("{renamed}{col_suffix}"),
                    );
                }
                metric.id = renamed;
                ctx.cauldron.use_ingredient(metric);
            }

            // Shared dimensions drive the join.
            let mut join_conditions = Vec::new();
            for dimension_id in compare.dimension_ids() {
                if !ctx.cauldron.dimension_ids().contains(&dimension_id) {
                    return Err(BadRecipe::CompareDimensionMissing { dim: dimension_id });
                }
                let base_dim = ctx
                    .cauldron
                    .get(&dimension_id)
                    .expect("dimension listed by the cauldron");
                let compare_dim = compare
                    .cauldron()
                    .get(&dimension_id)
                    .expect("dimension listed by the cauldron");
                let join_label = compare_dim.id_prop();
                if !compare_labels.contains(&join_label) {
                    return Err(BadRecipe::BlendJoinMissing(join_label));
                }
                join_conditions.push(SqlExpr::Compare {
                    op: CompareOp::Eq,
                    left: Box::new(
                        base_dim
                            .columns
                            .first()
                            .cloned()
                            .expect("dimension has a value column"),
                    ),
                    right: Box::new(SqlExpr::column(&alias, &join_label)),
                });
            }
            let on = if join_conditions.is_empty() {
                SqlExpr::Compare {
                    op: CompareOp::Eq,
                    left: Box::new(SqlExpr::literal(1.0)),
                    right: Box::new(SqlExpr::literal(1.0)),
                }
            } else {
                SqlExpr::And(join_conditions)
            };

            query.joins.push(Join {
                outer: true,
                item: FromItem::Subquery {
                    sql: compare_sql,
                    alias,
                },
                on,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{census_shelf, sqlite_session};

    fn base_recipe() -> Recipe {
        Recipe::new(census_shelf())
            .session(sqlite_session())
            .dimensions(&["state"])
            .unwrap()
            .metrics(&["pop2000"])
            .unwrap()
    }

    fn other_recipe(ids: (&str, &str)) -> Recipe {
        Recipe::new(census_shelf())
            .session(sqlite_session())
            .dimensions(&[ids.0])
            .unwrap()
            .metrics(&[ids.1])
            .unwrap()
    }

    #[test]
    fn test_blend_joins_subquery() {
        let mut blend = BlendRecipe::new();
        blend.blend(other_recipe(("state", "pop2008")), "state", "state");
        let mut recipe = base_recipe().with_extension(Box::new(blend));
        let sql = recipe.to_sql().unwrap();
        assert!(sql.contains("JOIN (SELECT"), "{sql}");
        assert!(sql.contains(") AS blend_1 ON census.state = blend_1.state"), "{sql}");
        assert!(sql.contains("blend_1.pop2008 AS pop2008"), "{sql}");
        // Blended metric is part of the recipe's cauldron now.
        assert!(recipe.metric_ids().contains(&"pop2008".to_string()));
    }

    #[test]
    fn test_full_blend_uses_outer_join() {
        let mut blend = BlendRecipe::new();
        blend.full_blend(other_recipe(("state", "pop2008")), "state", "state");
        let mut recipe = base_recipe().with_extension(Box::new(blend));
        let sql = recipe.to_sql().unwrap();
        assert!(sql.contains("LEFT OUTER JOIN (SELECT"), "{sql}");
    }

    #[test]
    fn test_blend_hoists_non_join_dimensions() {
        let other = Recipe::new(census_shelf())
            .session(sqlite_session())
            .dimensions(&["state", "sex"])
            .unwrap()
            .metrics(&["pop2008"])
            .unwrap();
        let mut blend = BlendRecipe::new();
        blend.blend(other, "state", "state");
        let mut recipe = base_recipe().with_extension(Box::new(blend));
        let sql = recipe.to_sql().unwrap();
        assert!(sql.contains("blend_1.sex AS sex"), "{sql}");
        assert!(sql.contains("GROUP BY census.state, blend_1.sex"), "{sql}");
    }

    #[test]
    fn test_blend_switches_to_direct_grouping() {
        let mut blend = BlendRecipe::new();
        blend.blend(other_recipe(("state", "pop2008")), "state", "state");
        let mut recipe = base_recipe().with_extension(Box::new(blend));
        let sql = recipe.to_sql().unwrap();
        assert!(sql.contains("GROUP BY census.state"), "{sql}");
    }

    #[test]
    fn test_blend_missing_join_dimension() {
        let mut blend = BlendRecipe::new();
        blend.blend(other_recipe(("sex", "pop2008")), "state", "ghost");
        let mut recipe = base_recipe().with_extension(Box::new(blend));
        assert!(recipe.query().is_err());
    }

    #[test]
    fn test_compare_hoists_suffixed_metrics() {
        let mut compare = CompareRecipe::new();
        compare.compare(other_recipe(("state", "pop2000")));
        let mut recipe = base_recipe().with_extension(Box::new(compare));
        let sql = recipe.to_sql().unwrap();
        assert!(
            sql.contains("avg(compare_1.pop2000) AS pop2000_compare"),
            "{sql}"
        );
        assert!(
            sql.contains("LEFT OUTER JOIN (SELECT"),
            "{sql}"
        );
        assert!(
            sql.contains("ON census.state = compare_1.state"),
            "{sql}"
        );
        assert!(recipe.metric_ids().contains(&"pop2000_compare".to_string()));
    }

    #[test]
    fn test_compare_dimension_must_exist_in_base() {
        let mut compare = CompareRecipe::new();
        compare.compare(other_recipe(("sex", "pop2008")));
        let mut recipe = base_recipe().with_extension(Box::new(compare));
        assert!(matches!(
            recipe.query(),
            Err(BadRecipe::CompareDimensionMissing { .. })
        ));
    }

    #[test]
    fn test_compare_custom_suffix() {
        let mut compare = CompareRecipe::new();
        compare.compare_suffixed(other_recipe(("state", "pop2008")), "_prior");
        let mut recipe = base_recipe().with_extension(Box::new(compare));
        let sql = recipe.to_sql().unwrap();
        assert!(sql.contains("AS pop2008_prior"), "{sql}");
    }
}
