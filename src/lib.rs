//! ladle: a declarative analytics engine.
//!
//! Text-based field expressions ("metrics", "dimensions", "filters")
//! compile into typed relational expressions, collect into reusable
//! ingredients on a shelf, and assemble into SQL queries through a
//! recipe builder with pluggable extensions.

pub mod cache;
pub mod config;
pub mod datatype;
pub mod error;
pub mod expression;
pub mod extensions;
pub mod ingredient;
pub mod recipe;
pub mod session;
pub mod shelf;
pub mod sql;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use cache::{MemoryCache, NoopCache, ShelfCache};
pub use config::{ShelfLoader, shelf_from_config, shelf_from_config_with};
pub use datatype::{Datatype, StorageType, Value};
pub use error::{BadIngredient, BadRecipe, CacheError, Diagnostic, GrammarError, SessionError};
pub use expression::{BuilderConfig, CompiledExpression, ExpressionBuilder, ParseOptions};
pub use ingredient::{
    FilterValue, Formatter, Ingredient, IngredientKind, LookupFormatter, NamedFilter, SortOrder,
};
pub use recipe::{Recipe, Stats};
pub use session::{QueryResult, Row, Selectable, Session, SourceColumn};
pub use shelf::Shelf;
pub use sql::{Dialect, SelectQuery, SqlExpr};
