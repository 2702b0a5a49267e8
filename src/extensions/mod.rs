//! Recipe extensions.
//!
//! Extensions are independent state machines held in an ordered list
//! on the recipe. The capability set mirrors the assembly pipeline:
//! ingredient injection, three part-rewriting phases, and row
//! enchantment. Every phase has a no-op default so an extension only
//! implements what it needs.

pub mod anonymize;
pub mod automatic_filters;
pub mod blend;
pub mod paginate;
pub mod summarize;

pub use anonymize::Anonymize;
pub use automatic_filters::AutomaticFilters;
pub use blend::{BlendRecipe, CompareRecipe};
pub use paginate::{Paginate, PaginationInfo};
pub use summarize::SummarizeOver;

use std::any::Any;

use crate::datatype::Value;
use crate::error::BadRecipe;
use crate::ingredient::Ingredient;
use crate::session::{Row, Session};
use crate::shelf::Shelf;
use crate::sql::{Dialect, OrderTerm, QueryTerm, SelectColumn, SelectQuery};

/// The brewed query parts before a statement exists.
#[derive(Debug, Clone, Default)]
pub struct RecipeParts {
    pub columns: Vec<SelectColumn>,
    pub group_bys: Vec<QueryTerm>,
    pub filters: Vec<crate::sql::SqlExpr>,
    pub havings: Vec<crate::sql::SqlExpr>,
    pub order_bys: Vec<OrderTerm>,
}

/// Context for the `add_ingredients` phase.
pub struct AddIngredientsContext<'a> {
    pub shelf: &'a Shelf,
    pub cauldron: &'a mut Shelf,
    pub order_bys: &'a mut Vec<Ingredient>,
}

/// Context for the pre/post query phases.
pub struct QueryContext<'a> {
    pub session: Option<&'a dyn Session>,
    pub dialect: Dialect,
    pub shelf: &'a Shelf,
    pub cauldron: &'a mut Shelf,
}

pub trait RecipeExtension: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Whether this extension's state changed since the last assembly.
    fn dirty(&self) -> bool {
        false
    }

    fn mark_clean(&mut self) {}

    /// Pull extension settings out of a recipe configuration tree.
    fn from_config(&mut self, _obj: &serde_json::Value) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Inject ingredients into the cauldron before brewing.
    fn add_ingredients(&mut self, _ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Rewrite the brewed parts before the statement is started.
    fn modify_recipe_parts(&mut self, _parts: &mut RecipeParts) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Rewrite the statement before the single-source check.
    fn modify_prequery_parts(
        &mut self,
        _query: &mut SelectQuery,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Rewrite the statement after the single-source check; the last
    /// chance before limit/offset apply.
    fn modify_postquery_parts(
        &mut self,
        _query: &mut SelectQuery,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Observe fetched rows before enchantment.
    fn after_fetch(&mut self, _rows: &[Row]) -> Result<(), BadRecipe> {
        Ok(())
    }

    /// Field names this extension adds to each enchanted row.
    fn enchant_add_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// Values for the added fields, one per name.
    fn enchant_row(&self, _row: &Row) -> Vec<Value> {
        Vec::new()
    }
}
