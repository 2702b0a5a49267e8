//! Re-summarization over a dimension.
//!
//! Wraps the assembled query as a subquery and aggregates the metrics
//! over the remaining dimensions, collapsing the summarized dimension
//! away. Each metric's summary aggregation comes from
//! `meta.summary_aggregation`, else from the shape of its expression.

use std::any::Any;

use crate::error::BadRecipe;
use crate::extensions::{QueryContext, RecipeExtension};
use crate::ingredient::{Ingredient, IngredientKind};
use crate::sql::{Dialect, OrderTerm, QueryTerm, SelectQuery, SqlExpr};

const SUBQUERY_ALIAS: &str = "summarize";

#[derive(Debug, Default)]
pub struct SummarizeOver {
    over: Option<String>,
    dirty: bool,
}

impl SummarizeOver {
    pub fn new() -> SummarizeOver {
        SummarizeOver::default()
    }

    pub fn summarize_over(&mut self, dimension_id: impl Into<String>) -> &mut Self {
        self.over = Some(dimension_id.into());
        self.dirty = true;
        self
    }
}

/// The summary aggregation for a metric: an explicit
/// `meta.summary_aggregation`, else a heuristic from the expression
/// (averages stay averages, sums and counts add up).
fn summary_aggregation(metric: &Ingredient, dialect: Dialect) -> Option<String> {
    if let Some(name) = metric
        .meta
        .get("summary_aggregation")
        .and_then(|v| v.as_str())
    {
        return Some(name.to_string());
    }
    let rendered = metric.expression()?.sql(dialect);
    if rendered.starts_with("avg") {
        Some("avg".to_string())
    } else if rendered.starts_with("count") || rendered.starts_with("sum") {
        Some("sum".to_string())
    } else {
        None
    }
}

impl RecipeExtension for SummarizeOver {
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

    fn from_config(&mut self, obj: &serde_json::Value) -> Result<(), BadRecipe> {
        if let Some(over) = obj.get("summarize_over").and_then(|v| v.as_str()) {
            self.summarize_over(over);
        }
        Ok(())
    }

    fn modify_postquery_parts(
        &mut self,
        query: &mut SelectQuery,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        let Some(over) = self.over.clone() else {
            return Ok(());
        };
        if !ctx.cauldron.dimension_ids().contains(&over) {
            return Err(BadRecipe::NotOnShelf(over));
        }

        // Labels of the kept dimensions and of each metric.
        let mut kept_dim_labels: Vec<String> = Vec::new();
        let mut metric_labels: Vec<(String, String)> = Vec::new();
        for ingredient in ctx.cauldron.ingredients() {
            let labels = ingredient
                .query_columns()
                .map_err(BadRecipe::Ingredient)?
                .into_iter()
                .map(|(_, label)| label);
            match ingredient.kind {
                IngredientKind::Dimension if ingredient.id != over => {
                    kept_dim_labels.extend(labels);
                }
                IngredientKind::Metric => {
                    let aggregation = summary_aggregation(ingredient, ctx.dialect)
                        .ok_or_else(|| {
                            BadRecipe::MissingSummaryAggregation(ingredient.id.clone())
                        })?;
                    for label in labels {
                        metric_labels.push((label, aggregation.clone()));
                    }
                }
                _ => {}
            }
        }

        let order_by: Vec<OrderTerm> = query
            .order_by
            .iter()
            .filter(|term| match &term.term {
                QueryTerm::Label(label) => kept_dim_labels.contains(label),
                QueryTerm::Expr(_) => false,
            })
            .cloned()
            .collect();

        let inner = query.as_subquery(SUBQUERY_ALIAS, ctx.dialect);
        let mut outer = SelectQuery::new();
        for label in &kept_dim_labels {
            outer.add_column(SqlExpr::column(SUBQUERY_ALIAS, label), label.clone());
            outer.group_by.push(QueryTerm::Label(label.clone()));
        }
        for (label, aggregation) in &metric_labels {
            outer.add_column(
                SqlExpr::func(
                    aggregation.clone(),
                    vec![SqlExpr::column(SUBQUERY_ALIAS, label)],
                ),
                label.clone(),
            );
        }
        outer.from.push(inner);
        outer.order_by = order_by;
        *query = outer;

        // The summarized dimension no longer exists in the result.
        ctx.cauldron.remove(&over);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;
    use crate::test_helpers::{census_shelf, sqlite_session};

    fn recipe_with(over: &str) -> Recipe {
        let mut summarize = SummarizeOver::new();
        summarize.summarize_over(over);
        Recipe::new(census_shelf())
            .session(sqlite_session())
            .dimensions(&["state", "sex"])
            .unwrap()
            .metrics(&["pop2000"])
            .unwrap()
            .with_extension(Box::new(summarize))
    }

    #[test]
    fn test_summarize_wraps_and_reaggregates() {
        let mut recipe = recipe_with("sex");
        let sql = recipe.to_sql().unwrap();
        assert!(
            sql.starts_with(
                "SELECT summarize.state AS state, sum(summarize.pop2000) AS pop2000 FROM (SELECT"
            ),
            "{sql}"
        );
        assert!(sql.ends_with(") AS summarize GROUP BY state"), "{sql}");
        // The summarized dimension is gone from the recipe.
        assert_eq!(recipe.dimension_ids(), vec!["state"]);
    }

    #[test]
    fn test_unknown_dimension_fails() {
        let mut recipe = recipe_with("ghost");
        assert!(matches!(recipe.query(), Err(BadRecipe::NotOnShelf(_))));
    }

    #[test]
    fn test_summary_aggregation_heuristic() {
        let met = crate::ingredient::Ingredient::metric(SqlExpr::func(
            "avg",
            vec![SqlExpr::column("census", "age")],
        ));
        assert_eq!(
            summary_aggregation(&met, Dialect::Sqlite),
            Some("avg".to_string())
        );

        let met = crate::ingredient::Ingredient::metric(SqlExpr::CountStar);
        assert_eq!(
            summary_aggregation(&met, Dialect::Sqlite),
            Some("sum".to_string())
        );

        // A metric with no recognizable shape needs explicit guidance.
        let met = crate::ingredient::Ingredient::metric(SqlExpr::func(
            "median",
            vec![SqlExpr::column("census", "age")],
        ));
        assert_eq!(summary_aggregation(&met, Dialect::Sqlite), None);
        let met = met.with_meta("summary_aggregation", serde_json::json!("avg"));
        assert_eq!(
            summary_aggregation(&met, Dialect::Sqlite),
            Some("avg".to_string())
        );
    }

    #[test]
    fn test_missing_summary_aggregation_is_error() {
        let mut shelf = census_shelf();
        shelf.insert(
            "med",
            crate::ingredient::Ingredient::metric(SqlExpr::func(
                "median",
                vec![SqlExpr::column("census", "age")],
            ))
            .with_datatype(Some(crate::datatype::Datatype::Num)),
        );
        let mut summarize = SummarizeOver::new();
        summarize.summarize_over("sex");
        let mut recipe = Recipe::new(shelf)
            .session(sqlite_session())
            .dimensions(&["state", "sex"])
            .unwrap()
            .metrics(&["med"])
            .unwrap()
            .with_extension(Box::new(summarize));
        assert!(matches!(
            recipe.query(),
            Err(BadRecipe::MissingSummaryAggregation(_))
        ));
    }
}
