//! Anonymization toggle.
//!
//! Ingredients that declare an anonymizer (a prebuilt formatter or a
//! pseudonym pattern) get it appended to their formatter list while
//! anonymization is on, and removed when it is off. Pseudonyms are
//! seeded deterministically from the input value so repeated inputs
//! produce stable fakes.

use std::any::Any;

use crate::error::BadRecipe;
use crate::extensions::{AddIngredientsContext, RecipeExtension};

#[derive(Debug, Default)]
pub struct Anonymize {
    anonymize: bool,
    dirty: bool,
}

impl Anonymize {
    pub fn new() -> Anonymize {
        Anonymize::default()
    }

    /// Should this recipe be anonymized.
    pub fn anonymize(&mut self, value: bool) -> &mut Self {
        if self.anonymize != value {
            self.anonymize = value;
            self.dirty = true;
        }
        self
    }
}

impl RecipeExtension for Anonymize {
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
        if let Some(value) = obj.get("anonymize").and_then(|v| v.as_bool()) {
            self.anonymize(value);
        }
        Ok(())
    }

    fn add_ingredients(&mut self, ctx: &mut AddIngredientsContext<'_>) -> Result<(), BadRecipe> {
        for ingredient in ctx.cauldron.values_mut() {
            let Some(spec) = ingredient.anonymizer.clone() else {
                continue;
            };
            if self.anonymize && !ingredient.anonymize {
                // Anonymizers go in the last formatter position.
                ingredient.formatters.push(spec.build());
                ingredient.anonymize = true;
            } else if !self.anonymize && ingredient.anonymize {
                ingredient.formatters.pop();
                ingredient.anonymize = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{Datatype, Value};
    use crate::ingredient::{AnonymizerSpec, Ingredient};
    use crate::shelf::Shelf;
    use crate::sql::SqlExpr;

    fn cauldron_with_anonymizer() -> Shelf {
        let mut cauldron = Shelf::new();
        cauldron.use_ingredient(
            Ingredient::dimension(SqlExpr::column("census", "state"))
                .with_id("state")
                .with_datatype(Some(Datatype::Str))
                .with_anonymizer(AnonymizerSpec::Pattern("name".to_string())),
        );
        cauldron
    }

    fn run(ext: &mut Anonymize, cauldron: &mut Shelf) {
        let shelf = Shelf::new();
        let mut order_bys = Vec::new();
        let mut ctx = AddIngredientsContext {
            shelf: &shelf,
            cauldron,
            order_bys: &mut order_bys,
        };
        ext.add_ingredients(&mut ctx).unwrap();
    }

    #[test]
    fn test_toggle_installs_and_removes_formatter() {
        let mut cauldron = cauldron_with_anonymizer();
        let mut ext = Anonymize::new();

        ext.anonymize(true);
        run(&mut ext, &mut cauldron);
        assert_eq!(cauldron.get("state").unwrap().formatters.len(), 1);
        assert!(cauldron.get("state").unwrap().anonymize);

        // Re-running while on does not double-install.
        run(&mut ext, &mut cauldron);
        assert_eq!(cauldron.get("state").unwrap().formatters.len(), 1);

        ext.anonymize(false);
        run(&mut ext, &mut cauldron);
        assert_eq!(cauldron.get("state").unwrap().formatters.len(), 0);
        assert!(!cauldron.get("state").unwrap().anonymize);
    }

    #[test]
    fn test_pseudonyms_are_stable() {
        let mut cauldron = cauldron_with_anonymizer();
        let mut ext = Anonymize::new();
        ext.anonymize(true);
        run(&mut ext, &mut cauldron);

        let ingredient = cauldron.get("state").unwrap();
        let a = ingredient.format_value(&Value::Str("Tennessee".into()));
        let b = ingredient.format_value(&Value::Str("Tennessee".into()));
        assert_eq!(a, b);
        assert_ne!(a, Value::Str("Tennessee".into()));
    }

    #[test]
    fn test_ingredients_without_anonymizer_untouched() {
        let mut cauldron = Shelf::new();
        cauldron.use_ingredient(
            Ingredient::dimension(SqlExpr::column("census", "age"))
                .with_id("age")
                .with_datatype(Some(Datatype::Num)),
        );
        let mut ext = Anonymize::new();
        ext.anonymize(true);
        run(&mut ext, &mut cauldron);
        assert!(cauldron.get("age").unwrap().formatters.is_empty());
    }
}
