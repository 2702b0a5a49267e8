//! Pagination with search and ordering override.
//!
//! Pages are limit/offset windows with validated page clamping. The
//! three construction variants differ only in how the total count is
//! derived: a second count query, an outer SELECT adding the
//! pagination window, or a `COUNT(*) OVER ()` window column on the
//! query itself.

use std::any::Any;

use serde_json::Value as Json;

use crate::datatype::Value;
use crate::error::{BadRecipe, SessionError};
use crate::extensions::{AddIngredientsContext, QueryContext, RecipeExtension};
use crate::ingredient::{FilterValue, Ingredient, IngredientKind, SortOrder};
use crate::recipe::count_rows;
use crate::session::Row;
use crate::sql::{SelectQuery, SqlExpr};

/// The window column label used by the inline counting variants.
const TOTAL_ITEMS_LABEL: &str = "_total_items";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountStrategy {
    /// Run `SELECT count(*)` over the assembled query.
    SecondQuery,
    /// Wrap the query and add the window column on the outer SELECT.
    InlineWindow,
    /// Add `COUNT(*) OVER ()` directly to the query's columns.
    CountOver,
}

/// Validated pagination data, available after execution.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub requested_page: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_items: u64,
}

pub struct Paginate {
    strategy: CountStrategy,
    apply_pagination: bool,
    apply_pagination_filters: bool,
    q: String,
    search_keys: Vec<String>,
    order_by: Vec<String>,
    page_size: u64,
    page: u64,
    validated: Option<PaginationInfo>,
    dirty: bool,
}

impl Paginate {
    /// Total count from a second query.
    pub fn new() -> Paginate {
        Self::with_strategy(CountStrategy::SecondQuery)
    }

    /// Total count from an outer SELECT adding the pagination window.
    pub fn inline() -> Paginate {
        Self::with_strategy(CountStrategy::InlineWindow)
    }

    /// Total count from a `COUNT(*) OVER ()` window column.
    pub fn count_over() -> Paginate {
        Self::with_strategy(CountStrategy::CountOver)
    }

    fn with_strategy(strategy: CountStrategy) -> Paginate {
        Paginate {
            strategy,
            apply_pagination: true,
            apply_pagination_filters: true,
            q: String::new(),
            search_keys: Vec::new(),
            order_by: Vec::new(),
            page_size: 0,
            page: 1,
            validated: None,
            dirty: false,
        }
    }

    /// A page size of zero disables pagination.
    pub fn pagination_page_size(&mut self, size: u64) -> &mut Self {
        self.page_size = size;
        self.dirty = true;
        self
    }

    pub fn pagination_page(&mut self, page: u64) -> &mut Self {
        self.page = page.max(1);
        self.dirty = true;
        self
    }

    /// Case-insensitive search across the pagination search keys (or
    /// every dimension in the recipe).
    pub fn pagination_q(&mut self, q: impl Into<String>) -> &mut Self {
        self.q = q.into();
        self.dirty = true;
        self
    }

    pub fn pagination_search_keys(&mut self, keys: Vec<String>) -> &mut Self {
        self.search_keys = keys;
        self.dirty = true;
        self
    }

    /// Ordering applied ahead of the recipe's own ordering.
    pub fn pagination_order_by(&mut self, keys: Vec<String>) -> &mut Self {
        self.order_by = keys;
        self.dirty = true;
        self
    }

    pub fn apply_pagination(&mut self, value: bool) -> &mut Self {
        self.apply_pagination = value;
        self.dirty = true;
        self
    }

    pub fn apply_pagination_filters(&mut self, value: bool) -> &mut Self {
        self.apply_pagination_filters = value;
        self.dirty = true;
        self
    }

    /// Pagination validated against the actual number of items.
    pub fn validated_pagination(&self) -> Result<&PaginationInfo, BadRecipe> {
        self.validated.as_ref().ok_or(BadRecipe::PaginationNotReady)
    }

    fn enabled(&self) -> bool {
        self.apply_pagination && self.page_size > 0
    }

    fn validate_against(&mut self, total_items: u64) -> u64 {
        let total_pages = total_items.div_ceil(self.page_size).max(1);
        let page = self.page.clamp(1, total_pages);
        self.validated = Some(PaginationInfo {
            requested_page: self.page,
            page,
            page_size: self.page_size,
            total_items,
        });
        page
    }

    fn apply_window(query: &mut SelectQuery, page_size: u64, page: u64) {
        query.limit = Some(page_size);
        let offset = page_size * (page - 1);
        if offset > 0 {
            query.offset = Some(offset);
        }
    }

    /// Prepend pagination ordering to the recipe's ordering, dropping
    /// recipe keys the pagination ordering already covers.
    fn apply_order_override(
        &self,
        ctx: &mut AddIngredientsContext<'_>,
    ) -> Result<(), BadRecipe> {
        if self.order_by.is_empty() {
            return Ok(());
        }
        let existing: Vec<String> = ctx
            .order_bys
            .iter()
            .map(|ing| {
                if ing.ordering == SortOrder::Desc {
                    format!("-{}", ing.id)
                } else {
                    ing.id.clone()
                }
            })
            .collect();
        let mut keys: Vec<String> = self.order_by.clone();
        for key in existing {
            let bare = key.trim_start_matches('-');
            let covered = self
                .order_by
                .iter()
                .any(|k| k.trim_start_matches('-') == bare);
            if !covered {
                keys.push(key);
            }
        }
        let mut resolved = Vec::new();
        for key in &keys {
            resolved.push(ctx.shelf.find(
                key,
                &[IngredientKind::Dimension, IngredientKind::Metric],
            )?);
        }
        *ctx.order_bys = resolved;
        Ok(())
    }

    fn apply_search(&self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        if !self.apply_pagination_filters || self.q.is_empty() {
            return Ok(());
        }
        let keys = if self.search_keys.is_empty() {
            ctx.cauldron.dimension_ids()
        } else {
            self.search_keys.clone()
        };
        let mut conditions = Vec::new();
        for key in &keys {
            if let Some(ingredient) = ctx.shelf.get(key) {
                conditions.push(ingredient.build_filter_expression(
                    FilterValue::Scalar(Value::Str(self.q.clone())),
                    Some("ilike"),
                    None,
                )?);
            }
        }
        if !conditions.is_empty() {
            let combined = if conditions.len() == 1 {
                conditions.into_iter().next().expect("one condition")
            } else {
                SqlExpr::Or(conditions)
            };
            ctx.cauldron
                .use_ingredient(Ingredient::filter(combined).with_id("_paginate_q"));
        }
        Ok(())
    }
}

impl Default for Paginate {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeExtension for Paginate {
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
        if let Some(v) = obj.get("apply_pagination").and_then(|v| v.as_bool()) {
            self.apply_pagination(v);
        }
        if let Some(v) = obj
            .get("apply_pagination_filters")
            .and_then(|v| v.as_bool())
        {
            self.apply_pagination_filters(v);
        }
        if let Some(v) = obj.get("pagination_q").and_then(|v| v.as_str()) {
            self.pagination_q(v);
        }
        if let Some(v) = obj.get("pagination_page_size").and_then(|v| v.as_u64()) {
            self.pagination_page_size(v);
        }
        if let Some(v) = obj.get("pagination_page").and_then(|v| v.as_u64()) {
            self.pagination_page(v);
        }
        for (key, setter) in [
            (
                "pagination_order_by",
                Self::pagination_order_by as fn(&mut Self, Vec<String>) -> &mut Self,
            ),
            ("pagination_search_keys", Self::pagination_search_keys),
        ] {
            if let Some(items) = obj.get(key).and_then(|v| v.as_array()) {
                let keys = items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect();
                setter(self, keys);
            }
        }
        Ok(())
    }

    fn add_ingredients(&mut self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        if !self.apply_pagination {
            return Ok(());
        }
        self.apply_order_override(ctx)?;
        self.apply_search(ctx)?;
        Ok(())
    }

    fn modify_postquery_parts(
        &mut self,
        query: &mut SelectQuery,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), BadRecipe> {
        if !self.enabled() {
            return Ok(());
        }
        match self.strategy {
            CountStrategy::SecondQuery => {
                let session = ctx.session.ok_or_else(|| {
                    BadRecipe::Session(SessionError(
                        "pagination requires a session to count rows".to_string(),
                    ))
                })?;
                let total = count_rows(session, query, ctx.dialect)?;
                let page = self.validate_against(total);
                Self::apply_window(query, self.page_size, page);
            }
            CountStrategy::InlineWindow => {
                // Hoist ordering to the outer statement so it still
                // holds after wrapping.
                let order_by = std::mem::take(&mut query.order_by);
                let labels = query.column_labels();
                let inner = query.as_subquery("pagination_window", ctx.dialect);
                let mut outer = SelectQuery::new();
                for label in labels {
                    outer.add_column(SqlExpr::column("pagination_window", &label), label);
                }
                outer.add_column(SqlExpr::WindowCount, TOTAL_ITEMS_LABEL);
                outer.from.push(inner);
                outer.order_by = order_by;
                *query = outer;
                Self::apply_window(query, self.page_size, self.page);
            }
            CountStrategy::CountOver => {
                query.add_column(SqlExpr::WindowCount, TOTAL_ITEMS_LABEL);
                Self::apply_window(query, self.page_size, self.page);
            }
        }
        Ok(())
    }

    fn after_fetch(&mut self, rows: &[Row]) -> Result<(), BadRecipe> {
        if !self.enabled() || self.strategy == CountStrategy::SecondQuery {
            return Ok(());
        }
        let total = rows
            .first()
            .and_then(|r| r.get(TOTAL_ITEMS_LABEL))
            .and_then(|v| match v {
                Value::Num(n) => Some(*n as u64),
                _ => None,
            })
            .unwrap_or(0);
        self.validate_against(total);
        Ok(())
    }
}
