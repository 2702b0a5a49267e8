//! The shelf: a string-keyed catalog of ingredients.
//!
//! Keys and ingredient ids are kept in sync, insertion order is
//! remembered separately from the deterministic emission order, and
//! enchantment (post-fetch row extension) lives here because it is a
//! property of the ingredients actually used.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::datatype::Value;
use crate::error::{BadIngredient, BadRecipe};
use crate::ingredient::{CauldronExtra, Ingredient, IngredientKind, SortOrder};
use crate::session::{Row, Selectable};

#[derive(Debug, Clone, Default)]
pub struct Shelf {
    ingredients: IndexMap<String, Ingredient>,
    /// Order in which ingredients were used, governing
    /// `dimension_ids` / `metric_ids`.
    ingredient_order: Vec<String>,
    /// The home selectable for shelves built from configuration.
    pub select_from: Option<Selectable>,
}

impl Shelf {
    pub fn new() -> Shelf {
        Shelf::default()
    }

    /// Insert an ingredient under a key, rewriting its id to match.
    pub fn insert(&mut self, key: impl Into<String>, mut ingredient: Ingredient) {
        let key = key.into();
        ingredient.id = key.clone();
        self.ingredients.insert(key, ingredient);
    }

    /// Insert while recording use order (the cauldron path).
    pub fn use_ingredient(&mut self, ingredient: Ingredient) {
        self.ingredient_order.push(ingredient.id.clone());
        self.ingredients
            .insert(ingredient.id.clone(), ingredient);
    }

    pub fn get(&self, key: &str) -> Option<&Ingredient> {
        self.ingredients.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Ingredient> {
        self.ingredients.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Ingredient> {
        self.ingredient_order.retain(|id| id != key);
        self.ingredients.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.ingredients.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.ingredients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ingredients.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.ingredients.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Ingredient> {
        self.ingredients.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Ingredient> {
        self.ingredients.values_mut()
    }

    /// Ingredients in deterministic emission order: dimensions,
    /// metrics, filters, havings; ties broken by id.
    pub fn ingredients(&self) -> Vec<&Ingredient> {
        let mut items: Vec<&Ingredient> = self.ingredients.values().collect();
        items.sort_by(|a, b| a.emission_order(b));
        items
    }

    fn ids_of_kind(&self, kind: IngredientKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .ingredients
            .values()
            .filter(|i| i.kind == kind)
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        // Stable-sort by use order; unused ingredients sink to the end.
        ids.sort_by_key(|id| {
            self.ingredient_order
                .iter()
                .position(|o| o == id)
                .unwrap_or(9999)
        });
        ids
    }

    /// Dimensions in the order they were used.
    pub fn dimension_ids(&self) -> Vec<String> {
        self.ids_of_kind(IngredientKind::Dimension)
    }

    /// Metrics in the order they were used.
    pub fn metric_ids(&self) -> Vec<String> {
        self.ids_of_kind(IngredientKind::Metric)
    }

    pub fn filter_ids(&self) -> Vec<String> {
        self.ids_of_kind(IngredientKind::Filter)
    }

    /// Look up an ingredient by id, checking its kind. A `-` prefix
    /// flips the returned ingredient's ordering to descending.
    pub fn find(&self, id: &str, kinds: &[IngredientKind]) -> Result<Ingredient, BadRecipe> {
        let (descending, key) = match id.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, id),
        };
        let ingredient = self
            .get(key)
            .ok_or_else(|| BadRecipe::NotOnShelf(key.to_string()))?;
        if !kinds.is_empty()
            && !kinds.contains(&ingredient.kind)
            && ingredient.kind != IngredientKind::Invalid
        {
            return Err(BadRecipe::WrongKind {
                id: key.to_string(),
                expected: kinds
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(" or "),
            });
        }
        let mut found = ingredient.clone();
        if descending {
            found.ordering = SortOrder::Desc;
        }
        Ok(found)
    }

    /// Fail if any used ingredient is an invalid placeholder.
    pub fn check_valid(&self) -> Result<(), BadIngredient> {
        for ingredient in self.ingredients.values() {
            if ingredient.kind == IngredientKind::Invalid {
                return Err(BadIngredient::InvalidUsed {
                    id: ingredient.id.clone(),
                    detail: ingredient
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
        }
        Ok(())
    }

    /// Extend each row with every ingredient's cauldron extras:
    /// formatter outputs and dimension `_id` aliases.
    pub fn enchant(&self, rows: Vec<Row>) -> Result<Vec<Row>, BadIngredient> {
        if rows.is_empty() {
            return Ok(rows);
        }

        let mut extras: Vec<(String, &Ingredient, CauldronExtra)> = Vec::new();
        for ingredient in self.ingredients.values() {
            if !matches!(
                ingredient.kind,
                IngredientKind::Dimension | IngredientKind::Metric
            ) {
                continue;
            }
            for (field, extra) in ingredient.cauldron_extras() {
                // A dimension with an id role already selects its
                // `_id` column; don't shadow fetched fields.
                if rows[0].get(&field).is_some() {
                    continue;
                }
                extras.push((field, ingredient, extra));
            }
        }
        if extras.is_empty() {
            return Ok(rows);
        }

        let mut fields: Vec<String> = rows[0].fields().to_vec();
        fields.extend(extras.iter().map(|(f, _, _)| f.clone()));
        let fields = Arc::new(fields);

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(extras.len());
            for (_, ingredient, extra) in &extras {
                let value = match extra {
                    CauldronExtra::Formatted { source_field } => {
                        let raw = row.get(source_field).cloned().unwrap_or(Value::Null);
                        ingredient.format_value(&raw)
                    }
                    CauldronExtra::Alias { source_field } => {
                        row.get(source_field).cloned().unwrap_or(Value::Null)
                    }
                };
                values.push(value);
            }
            out.push(row.extend(fields.clone(), values));
        }
        Ok(out)
    }
}
