//! The recipe assembler.
//!
//! A recipe collects ingredients from a shelf into a cauldron, runs
//! the extension phases, and assembles one SELECT statement. The
//! statement is cached until a builder method or extension marks the
//! recipe dirty; fetched rows are cached separately.

use std::sync::Arc;
use std::time::Instant;

use crate::datatype::{Datatype, Value};
use crate::error::BadRecipe;
use crate::extensions::{AddIngredientsContext, QueryContext, RecipeExtension, RecipeParts};
use crate::ingredient::{Ingredient, IngredientKind};
use crate::session::{Row, Selectable, Session, SourceColumn};
use crate::shelf::Shelf;
use crate::sql::{Dialect, FromItem, SelectQuery, SqlExpr};

/// Execution statistics, readable after `all()`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    ready: bool,
    rows: usize,
    dbtime: f64,
    enchanttime: f64,
    from_cache: bool,
}

impl Stats {
    fn set(&mut self, rows: usize, dbtime: f64, enchanttime: f64, from_cache: bool) {
        self.ready = true;
        self.rows = rows;
        self.dbtime = dbtime;
        self.enchanttime = enchanttime;
        self.from_cache = from_cache;
    }

    pub fn rows(&self) -> Result<usize, BadRecipe> {
        self.get(|s| s.rows)
    }

    pub fn dbtime(&self) -> Result<f64, BadRecipe> {
        self.get(|s| s.dbtime)
    }

    pub fn enchanttime(&self) -> Result<f64, BadRecipe> {
        self.get(|s| s.enchanttime)
    }

    pub fn from_cache(&self) -> Result<bool, BadRecipe> {
        self.get(|s| s.from_cache)
    }

    fn get<T>(&self, f: impl Fn(&Stats) -> T) -> Result<T, BadRecipe> {
        if self.ready {
            Ok(f(self))
        } else {
            Err(BadRecipe::StatsNotReady)
        }
    }
}

pub struct Recipe {
    shelf: Shelf,
    cauldron: Shelf,
    order_bys: Vec<Ingredient>,
    session: Option<Arc<dyn Session>>,
    select_from: Option<Selectable>,
    limit: u64,
    offset: u64,
    dirty: bool,
    all_dirty: bool,
    cached_query: Option<SelectQuery>,
    cached_rows: Vec<Row>,
    extensions: Vec<Box<dyn RecipeExtension>>,
    pub stats: Stats,
}

impl Recipe {
    pub fn new(shelf: Shelf) -> Recipe {
        let select_from = shelf.select_from.clone();
        Recipe {
            shelf,
            cauldron: Shelf::new(),
            order_bys: Vec::new(),
            session: None,
            select_from,
            limit: 0,
            offset: 0,
            dirty: true,
            all_dirty: true,
            cached_query: None,
            cached_rows: Vec::new(),
            extensions: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// Construct a recipe from a plain configuration tree: the core
    /// keys (metrics, dimensions, filters, order_by, limit, offset)
    /// plus one `from_config` pass over each active extension.
    pub fn from_config(
        shelf: Shelf,
        obj: &serde_json::Value,
        extensions: Vec<Box<dyn RecipeExtension>>,
    ) -> Result<Recipe, BadRecipe> {
        let mut recipe = Recipe::new(shelf);
        recipe.extensions = extensions;

        let string_list = |key: &str| -> Vec<String> {
            obj.get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        for id in string_list("metrics") {
            recipe.use_metric(&id)?;
        }
        for id in string_list("dimensions") {
            recipe.use_dimension(&id)?;
        }
        for id in string_list("filters") {
            recipe.use_filter(&id)?;
        }
        let order_by = string_list("order_by");
        if !order_by.is_empty() {
            let refs: Vec<&str> = order_by.iter().map(String::as_str).collect();
            recipe.set_order_by(&refs)?;
        }
        if let Some(limit) = obj.get("limit").and_then(|v| v.as_u64()) {
            recipe.limit = limit;
        }
        if let Some(offset) = obj.get("offset").and_then(|v| v.as_u64()) {
            recipe.offset = offset;
        }

        let mut extensions = std::mem::take(&mut recipe.extensions);
        for ext in &mut extensions {
            ext.from_config(obj)?;
        }
        recipe.extensions = extensions;
        Ok(recipe)
    }

    // ---- builder methods; each sets the dirty flag ----

    pub fn metrics(mut self, ids: &[&str]) -> Result<Recipe, BadRecipe> {
        for id in ids {
            self.use_metric(id)?;
        }
        Ok(self)
    }

    pub fn dimensions(mut self, ids: &[&str]) -> Result<Recipe, BadRecipe> {
        for id in ids {
            self.use_dimension(id)?;
        }
        Ok(self)
    }

    pub fn filters(mut self, ids: &[&str]) -> Result<Recipe, BadRecipe> {
        for id in ids {
            self.use_filter(id)?;
        }
        Ok(self)
    }

    fn use_metric(&mut self, id: &str) -> Result<(), BadRecipe> {
        let found = self.shelf.find(id, &[IngredientKind::Metric])?;
        self.cauldron.use_ingredient(found);
        self.dirty = true;
        Ok(())
    }

    fn use_dimension(&mut self, id: &str) -> Result<(), BadRecipe> {
        let found = self.shelf.find(id, &[IngredientKind::Dimension])?;
        self.cauldron.use_ingredient(found);
        self.dirty = true;
        Ok(())
    }

    fn use_filter(&mut self, id: &str) -> Result<(), BadRecipe> {
        let found = self
            .shelf
            .find(id, &[IngredientKind::Filter, IngredientKind::Having])?;
        self.cauldron.use_ingredient(found);
        self.dirty = true;
        Ok(())
    }

    /// Add a raw boolean expression as an anonymous filter.
    pub fn filter_expression(mut self, id: &str, expr: SqlExpr) -> Recipe {
        self.cauldron
            .use_ingredient(Ingredient::filter(expr).with_id(id));
        self.dirty = true;
        self
    }

    /// Order by shelf ingredients; a `-` prefix means descending.
    pub fn order_by(mut self, ids: &[&str]) -> Result<Recipe, BadRecipe> {
        self.set_order_by(ids)?;
        Ok(self)
    }

    pub(crate) fn set_order_by(&mut self, ids: &[&str]) -> Result<(), BadRecipe> {
        self.order_bys.clear();
        for id in ids {
            let found = self
                .shelf
                .find(id, &[IngredientKind::Dimension, IngredientKind::Metric])?;
            self.order_bys.push(found);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn limit(mut self, limit: u64) -> Recipe {
        if self.limit != limit {
            self.dirty = true;
            self.limit = limit;
        }
        self
    }

    pub fn offset(mut self, offset: u64) -> Recipe {
        if self.offset != offset {
            self.dirty = true;
            self.offset = offset;
        }
        self
    }

    pub fn select_from(mut self, selectable: Selectable) -> Recipe {
        self.select_from = Some(selectable);
        self.dirty = true;
        self
    }

    pub fn session(mut self, session: Arc<dyn Session>) -> Recipe {
        self.session = Some(session);
        self.dirty = true;
        self
    }

    pub fn with_extension(mut self, extension: Box<dyn RecipeExtension>) -> Recipe {
        self.extensions.push(extension);
        self.dirty = true;
        self
    }

    /// Borrow an active extension by type.
    pub fn extension<T: RecipeExtension>(&self) -> Option<&T> {
        self.extensions
            .iter()
            .find_map(|e| e.as_any().downcast_ref::<T>())
    }

    /// Mutably borrow an active extension by type; marks the recipe
    /// dirty since extension state is about to change.
    pub fn extension_mut<T: RecipeExtension>(&mut self) -> Option<&mut T> {
        self.dirty = true;
        self.extensions
            .iter_mut()
            .find_map(|e| e.as_any_mut().downcast_mut::<T>())
    }

    pub fn dimension_ids(&self) -> Vec<String> {
        self.cauldron.dimension_ids()
    }

    pub fn metric_ids(&self) -> Vec<String> {
        self.cauldron.metric_ids()
    }

    pub fn dialect(&self) -> Dialect {
        self.session
            .as_ref()
            .map(|s| s.dialect())
            .unwrap_or(Dialect::Postgres)
    }

    fn is_dirty(&self) -> bool {
        self.dirty || self.extensions.iter().any(|e| e.dirty())
    }

    // ---- assembly ----

    /// Assemble (or return the cached) statement.
    pub fn query(&mut self) -> Result<SelectQuery, BadRecipe> {
        if self.cauldron.is_empty() {
            return Err(BadRecipe::NoIngredients);
        }
        if !self.is_dirty()
            && let Some(query) = &self.cached_query
        {
            return Ok(query.clone());
        }

        self.cauldron.check_valid()?;

        let dialect = self.dialect();
        let mut extensions = std::mem::take(&mut self.extensions);
        let result = self.assemble(dialect, &mut extensions);
        self.extensions = extensions;
        let query = result?;

        self.cached_query = Some(query.clone());
        self.dirty = false;
        self.all_dirty = true;
        for ext in &mut self.extensions {
            ext.mark_clean();
        }
        Ok(query)
    }

    fn assemble(
        &mut self,
        dialect: Dialect,
        extensions: &mut [Box<dyn RecipeExtension>],
    ) -> Result<SelectQuery, BadRecipe> {
        // Step 1: extensions inject ingredients.
        {
            let mut ctx = AddIngredientsContext {
                shelf: &self.shelf,
                cauldron: &mut self.cauldron,
                order_bys: &mut self.order_bys,
            };
            for ext in extensions.iter_mut() {
                ext.add_ingredients(&mut ctx)?;
            }
        }
        self.cauldron.check_valid()?;

        // Step 2: brew the parts.
        let mut parts = self.brew_parts(dialect)?;

        // Step 3: extensions rewrite parts.
        for ext in extensions.iter_mut() {
            ext.modify_recipe_parts(&mut parts)?;
        }

        // Step 4: start the statement.
        let mut query = SelectQuery {
            columns: parts.columns,
            from: Vec::new(),
            joins: Vec::new(),
            filters: parts.filters,
            group_by: parts.group_bys,
            havings: parts.havings,
            order_by: parts.order_bys,
            limit: None,
            offset: None,
        };
        if let Some(select_from) = &self.select_from {
            query.from.push(select_from.from_item());
        }

        // Step 5: prequery rewrites.
        {
            let mut ctx = QueryContext {
                session: self.session.as_deref(),
                dialect,
                shelf: &self.shelf,
                cauldron: &mut self.cauldron,
            };
            for ext in extensions.iter_mut() {
                ext.modify_prequery_parts(&mut query, &mut ctx)?;
            }
        }

        // Step 6: single-source invariant. Shelves built from config
        // set select_from and bypass this.
        if self.select_from.is_none() {
            let tables = query.referenced_tables();
            if tables.len() != 1 {
                let detail: Vec<String> = self
                    .cauldron
                    .ingredients()
                    .iter()
                    .map(|i| i.describe(dialect))
                    .collect();
                return Err(BadRecipe::MultipleSources(format!(
                    "{} ({})",
                    tables.join(", "),
                    detail.join("; ")
                )));
            }
            query.from.push(FromItem::Table(tables[0].clone()));
        }

        // Step 7: postquery rewrites.
        {
            let mut ctx = QueryContext {
                session: self.session.as_deref(),
                dialect,
                shelf: &self.shelf,
                cauldron: &mut self.cauldron,
            };
            for ext in extensions.iter_mut() {
                ext.modify_postquery_parts(&mut query, &mut ctx)?;
            }
        }

        // Step 8: limit and offset at the outermost level.
        if self.limit > 0 {
            query.limit = Some(self.limit);
        }
        if self.offset > 0 {
            query.offset = Some(self.offset);
        }

        Ok(query)
    }

    /// Gather columns, group-bys, filters, and havings from the
    /// cauldron in deterministic order, de-duplicated by SQL identity.
    fn brew_parts(&self, dialect: Dialect) -> Result<RecipeParts, BadRecipe> {
        let mut parts = RecipeParts::default();
        let mut seen_columns: Vec<String> = Vec::new();
        let mut seen_group_bys: Vec<String> = Vec::new();
        let mut seen_filters: Vec<String> = Vec::new();
        let mut seen_havings: Vec<String> = Vec::new();

        for ingredient in self.cauldron.ingredients() {
            for (expr, label) in ingredient.query_columns().map_err(BadRecipe::Ingredient)? {
                let key = format!("{label}:{}", expr.sql(dialect));
                if !seen_columns.contains(&key) {
                    seen_columns.push(key);
                    parts
                        .columns
                        .push(crate::sql::SelectColumn { expr, label });
                }
            }
            for term in ingredient.group_by_terms().map_err(BadRecipe::Ingredient)? {
                let key = match &term {
                    crate::sql::QueryTerm::Label(l) => l.clone(),
                    crate::sql::QueryTerm::Expr(e) => e.sql(dialect),
                };
                if !seen_group_bys.contains(&key) {
                    seen_group_bys.push(key);
                    parts.group_bys.push(term);
                }
            }
            for filter in &ingredient.filters {
                let key = filter.sql(dialect);
                if !seen_filters.contains(&key) {
                    seen_filters.push(key);
                    parts.filters.push(filter.clone());
                }
            }
            for having in &ingredient.havings {
                let key = having.sql(dialect);
                if !seen_havings.contains(&key) {
                    seen_havings.push(key);
                    parts.havings.push(having.clone());
                }
            }
        }

        let mut seen_orders: Vec<String> = Vec::new();
        for ingredient in &self.order_bys {
            for term in ingredient.order_by_terms().map_err(BadRecipe::Ingredient)? {
                let key = match &term.term {
                    crate::sql::QueryTerm::Label(l) => l.clone(),
                    crate::sql::QueryTerm::Expr(e) => e.sql(dialect),
                };
                if !seen_orders.contains(&key) {
                    seen_orders.push(key);
                    parts.order_bys.push(term);
                }
            }
        }

        Ok(parts)
    }

    /// The SQL this recipe generates.
    pub fn to_sql(&mut self) -> Result<String, BadRecipe> {
        let dialect = self.dialect();
        Ok(self.query()?.to_sql(dialect))
    }

    /// The recipe's statement as a subquery with an assigned alias.
    pub fn subquery_sql(&mut self) -> Result<String, BadRecipe> {
        self.to_sql()
    }

    /// Expose this recipe's outer SELECT as a selectable for catalogs
    /// and blending.
    pub fn as_selectable(&mut self, alias: &str) -> Result<Selectable, BadRecipe> {
        let sql = self.to_sql()?;
        let mut columns = Vec::new();
        for ingredient in self.cauldron.ingredients() {
            let suffixes = ingredient
                .make_column_suffixes()
                .map_err(BadRecipe::Ingredient)?;
            for (role, suffix) in ingredient
                .role_keys
                .iter()
                .map(Some)
                .chain(std::iter::repeat(None))
                .zip(&suffixes)
            {
                let datatype = role
                    .and_then(|r| ingredient.datatype_by_role.get(r).copied())
                    .or(ingredient.datatype)
                    .unwrap_or(Datatype::Str);
                columns.push(SourceColumn {
                    name: format!("{}{suffix}", ingredient.id),
                    datatype,
                });
            }
        }
        Ok(Selectable::subquery(alias, sql, columns))
    }

    /// The ingredients actually used, exposed to blending and
    /// summarization.
    pub(crate) fn cauldron(&self) -> &Shelf {
        &self.cauldron
    }

    // ---- execution ----

    fn require_session(&self) -> Result<Arc<dyn Session>, BadRecipe> {
        self.session
            .clone()
            .ok_or_else(|| BadRecipe::Session(crate::error::SessionError(
                "no session attached to this recipe".to_string(),
            )))
    }

    /// Execute and return enchanted rows. Results are cached until the
    /// recipe is marked dirty.
    pub fn all(&mut self) -> Result<Vec<Row>, BadRecipe> {
        let start = Instant::now();

        if !self.is_dirty() && !self.all_dirty {
            let rows = self.cached_rows.clone();
            self.stats.set(rows.len(), 0.0, 0.0, true);
            return Ok(rows);
        }

        let sql = self.to_sql()?;
        let session = self.require_session()?;
        let result = session.execute(&sql)?;
        let fetch_elapsed = start.elapsed().as_secs_f64();
        let from_cache = !result.saved_to_cache;

        let fields = Arc::new(result.columns);
        let rows: Vec<Row> = result
            .rows
            .into_iter()
            .map(|values| Row::new(fields.clone(), values))
            .collect();

        // Extensions observe raw rows (pagination totals), then the
        // cauldron and extensions enchant them.
        let enchant_start = Instant::now();
        let mut extensions = std::mem::take(&mut self.extensions);
        let mut fetch_result: Result<(), BadRecipe> = Ok(());
        for ext in &mut extensions {
            if let Err(e) = ext.after_fetch(&rows) {
                fetch_result = Err(e);
                break;
            }
        }
        self.extensions = extensions;
        fetch_result?;

        let mut rows = self.cauldron.enchant(rows).map_err(BadRecipe::Ingredient)?;
        rows = self.enchant_extensions(rows);
        let enchant_elapsed = enchant_start.elapsed().as_secs_f64();

        self.cached_rows = rows.clone();
        self.all_dirty = false;
        self.stats
            .set(rows.len(), fetch_elapsed, enchant_elapsed, from_cache);
        Ok(rows)
    }

    fn enchant_extensions(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut extra_fields: Vec<String> = Vec::new();
        for ext in &self.extensions {
            extra_fields.extend(ext.enchant_add_fields());
        }
        if extra_fields.is_empty() {
            return rows;
        }
        let mut fields: Vec<String> = rows
            .first()
            .map(|r| r.fields().to_vec())
            .unwrap_or_default();
        fields.extend(extra_fields);
        let fields = Arc::new(fields);
        rows.into_iter()
            .map(|row| {
                let mut values = Vec::new();
                for ext in &self.extensions {
                    values.extend(ext.enchant_row(&row));
                }
                row.extend(fields.clone(), values)
            })
            .collect()
    }

    /// First row of the result, if any.
    pub fn one(&mut self) -> Result<Option<Row>, BadRecipe> {
        Ok(self.all()?.into_iter().next())
    }

    /// The number of rows this recipe would return, ignoring any
    /// limit.
    pub fn total_count(&mut self) -> Result<u64, BadRecipe> {
        let dialect = self.dialect();
        let mut query = self.query()?;
        query.limit = None;
        query.offset = None;
        // Ordering is irrelevant to the count and slows it down.
        query.order_by.clear();
        let session = self.require_session()?;
        count_rows(session.as_ref(), &query, dialect)
    }
}

/// Run `SELECT count(*) FROM (query)` and read the single value.
pub(crate) fn count_rows(
    session: &dyn Session,
    query: &SelectQuery,
    dialect: Dialect,
) -> Result<u64, BadRecipe> {
    let mut count_query = SelectQuery::new();
    count_query.add_column(SqlExpr::CountStar, "count");
    count_query
        .from
        .push(query.as_subquery("count_subquery", dialect));
    let result = session.execute(&count_query.to_sql(dialect))?;
    let value = result
        .rows
        .first()
        .and_then(|r| r.first())
        .cloned()
        .unwrap_or(Value::Num(0.0));
    match value {
        Value::Num(n) => Ok(n.max(0.0) as u64),
        _ => Ok(0),
    }
}
