//! The expression compiler front door.
//!
//! An [`ExpressionBuilder`] owns the catalog, grammar, and caches for
//! one selectable (plus any extra selectables and constants) and turns
//! field texts into backend expressions with inferred datatypes.
//!
//! Two caches cooperate here. Parsers are memoized process-wide by
//! grammar hash because they are not serializable. Parse trees are
//! memoized in an injected [`ShelfCache`] keyed by (grammar hash,
//! field text, flags); a cached tree that fails to lower — a drifted
//! schema, a stale format — is evicted and rebuilt from source.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ast::ExprNode;
use super::catalog::{Col, ColCollection};
use super::grammar::{grammar_hash, make_grammar, make_key};
use super::parser::FieldParser;
use super::transform::{LoweredCol, Transformer};
use super::validate::{Validation, Validator};
use crate::cache::ShelfCache;
use crate::datatype::{Datatype, Value};
use crate::error::GrammarError;
use crate::session::{Selectable, SourceColumn};
use crate::sql::{Dialect, SelectQuery, SqlExpr};

/// Process-wide parser memo. Populated on first use, never evicted;
/// concurrent construction of identical catalogs may do redundant
/// builds, which is acceptable.
static PARSER_CACHE: OnceLock<Mutex<HashMap<String, Arc<FieldParser>>>> = OnceLock::new();

fn parser_cache() -> &'static Mutex<HashMap<String, Arc<FieldParser>>> {
    PARSER_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop all memoized parsers. Test hook.
pub fn clear_parser_cache() {
    if let Ok(mut map) = parser_cache().lock() {
        map.clear();
    }
}

/// Flags for one parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOptions {
    /// The expression may not contain aggregations.
    pub forbid_aggregation: bool,
    /// Wrap a bare numeric expression in `sum(...)`.
    pub enforce_aggregation: bool,
    /// Truncation applied to every date column reference.
    pub convert_dates_with: Option<String>,
    /// Truncation applied to every datetime column reference.
    pub convert_datetimes_with: Option<String>,
}

impl ParseOptions {
    fn cache_parts(&self) -> [String; 4] {
        [
            self.forbid_aggregation.to_string(),
            self.enforce_aggregation.to_string(),
            self.convert_dates_with.clone().unwrap_or_default(),
            self.convert_datetimes_with.clone().unwrap_or_default(),
        ]
    }
}

/// A successfully compiled field.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    pub expr: SqlExpr,
    pub datatype: Option<Datatype>,
}

/// A parse tree plus validator verdict, as held in the tree cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedParse {
    tree: ExprNode,
    validation: Validation,
}

/// Optional builder inputs.
#[derive(Default)]
pub struct BuilderConfig {
    /// Additional selectables, each with a required namespace.
    pub extra_selectables: Vec<(Selectable, String)>,
    /// Named constants usable in expressions under the `constants`
    /// namespace. String values containing `(` and `)` are compiled as
    /// expressions over the base selectable.
    pub constants: BTreeMap<String, Value>,
    pub cache: Option<Arc<dyn ShelfCache>>,
    /// Reference date for intelligent date math; defaults to today.
    pub today: Option<NaiveDate>,
}

fn is_constant_expression(v: &Value) -> bool {
    matches!(v, Value::Str(s) if s.contains('(') && s.contains(')'))
}

pub struct ExpressionBuilder {
    columns: ColCollection,
    lowered: HashMap<String, LoweredCol>,
    dialect: Dialect,
    grammar: String,
    hash: String,
    cache_key: String,
    parser: Arc<FieldParser>,
    cache: Option<Arc<dyn ShelfCache>>,
    cached_trees: Option<HashMap<String, CachedParse>>,
    today: NaiveDate,
    /// The datatype of the last parsed expression.
    pub last_datatype: Option<Datatype>,
}

impl ExpressionBuilder {
    pub fn new(selectable: &Selectable, drivername: &str) -> Result<Self, GrammarError> {
        Self::with_config(selectable, drivername, BuilderConfig::default())
    }

    pub fn with_config(
        selectable: &Selectable,
        drivername: &str,
        config: BuilderConfig,
    ) -> Result<Self, GrammarError> {
        let dialect = Dialect::from_drivername(drivername);
        let mut columns = ColCollection::for_selectable(selectable, None);

        // Literal constants live in the `constants` namespace.
        let literals: BTreeMap<&String, &Value> = config
            .constants
            .iter()
            .filter(|(_, v)| !is_constant_expression(v))
            .collect();
        if !literals.is_empty() {
            columns.extend(ColCollection::for_constants(
                literals.into_iter(),
                Some("constants"),
            ));
        }

        // Expression constants compile over the base selectable and
        // become a one-row subquery exposed as an extra selectable.
        let expressions: BTreeMap<&String, &Value> = config
            .constants
            .iter()
            .filter(|(_, v)| is_constant_expression(v))
            .collect();
        if !expressions.is_empty() {
            let constants_selectable =
                Self::build_constant_expressions(selectable, drivername, &expressions)?;
            columns.extend(ColCollection::for_selectable(
                &constants_selectable,
                Some("constants"),
            ));
        }

        for (extra, namespace) in &config.extra_selectables {
            columns.extend(ColCollection::for_selectable(extra, Some(namespace)));
        }

        columns.assign_indexes();
        let grammar = make_grammar(&columns);
        let hash = grammar_hash(&grammar);
        let cache_key = format!("ladle-expr:{hash}");

        let parser = {
            let mut memo = parser_cache().lock().expect("parser cache poisoned");
            memo.entry(hash.clone())
                .or_insert_with(|| Arc::new(FieldParser::new(&columns)))
                .clone()
        };

        let cached_trees = match &config.cache {
            None => None,
            Some(cache) => match cache.get(&cache_key) {
                Ok(Some(blob)) => match serde_json::from_str(&blob) {
                    Ok(map) => Some(map),
                    Err(error) => {
                        tracing::warn!(%error, "discarding undecodable tree cache entry");
                        Some(HashMap::new())
                    }
                },
                Ok(None) => Some(HashMap::new()),
                Err(error) => {
                    tracing::warn!(%error, "tree cache read failed, proceeding uncached");
                    Some(HashMap::new())
                }
            },
        };

        let lowered = columns
            .columns
            .iter()
            .map(|c| {
                (
                    c.rule_name(),
                    LoweredCol {
                        expr: c.lower(),
                        datatype: c.datatype,
                    },
                )
            })
            .collect();

        Ok(ExpressionBuilder {
            columns,
            lowered,
            dialect,
            grammar,
            hash,
            cache_key,
            parser,
            cache: config.cache,
            cached_trees,
            today: config
                .today
                .unwrap_or_else(|| chrono::Local::now().date_naive()),
            last_datatype: None,
        })
    }

    /// Compile constant expressions into a one-row `constants`
    /// subquery selectable.
    fn build_constant_expressions(
        selectable: &Selectable,
        drivername: &str,
        expressions: &BTreeMap<&String, &Value>,
    ) -> Result<Selectable, GrammarError> {
        let mut inner = ExpressionBuilder::new(selectable, drivername)?;
        let mut query = SelectQuery::new();
        let mut out_columns = Vec::new();
        for (name, value) in expressions {
            let Value::Str(text) = value else {
                continue;
            };
            let compiled = inner.parse(text, &ParseOptions::default())?;
            query.add_column(compiled.expr, name.as_str());
            out_columns.push(SourceColumn {
                name: (*name).clone(),
                datatype: compiled.datatype.unwrap_or(Datatype::Unusable),
            });
        }
        query.from.push(selectable.from_item());
        let sql = query.to_sql(Dialect::from_drivername(drivername));
        Ok(Selectable::subquery("constants", sql, out_columns))
    }

    pub fn grammar(&self) -> &str {
        &self.grammar
    }

    pub fn grammar_hash(&self) -> &str {
        &self.hash
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn columns(&self) -> &ColCollection {
        &self.columns
    }

    /// Find a catalog column by its user-facing field name.
    pub fn find_column(&self, field_name: &str) -> Option<&Col> {
        self.columns
            .columns
            .iter()
            .find(|c| c.field_name().eq_ignore_ascii_case(field_name))
    }

    /// Compile a field text into a backend expression and datatype.
    pub fn parse(
        &mut self,
        text: &str,
        options: &ParseOptions,
    ) -> Result<CompiledExpression, GrammarError> {
        let parts = options.cache_parts();
        let mut key_parts = vec![text];
        key_parts.extend(parts.iter().map(|s| s.as_str()));
        let key = make_key("parsed-field", key_parts);

        if let Some(cached) = self
            .cached_trees
            .as_ref()
            .and_then(|trees| trees.get(&key).cloned())
        {
            match self.lower(text, &cached.tree, &cached.validation, options) {
                Ok(compiled) => return Ok(compiled),
                Err(error) => {
                    // Anything wrong with cached data — schema drift,
                    // stale encoding — falls back to a clean parse.
                    tracing::warn!(%error, field = text, "cached tree failed to lower, evicting");
                    if let Some(trees) = self.cached_trees.as_mut() {
                        trees.remove(&key);
                    }
                }
            }
        }

        let (tree, validation) = self.parse_and_validate(text, options.forbid_aggregation)?;
        let compiled = self.lower(text, &tree, &validation, options)?;
        if let Some(trees) = self.cached_trees.as_mut() {
            trees.insert(key, CachedParse { tree, validation });
        }
        Ok(compiled)
    }

    fn parse_and_validate(
        &self,
        text: &str,
        forbid_aggregation: bool,
    ) -> Result<(ExprNode, Validation), GrammarError> {
        let tree = self.parser.parse(text)?;
        let mut validator = Validator::new(text, forbid_aggregation, self.dialect);
        let validation = validator.validate(&tree);
        if !validator.diagnostics.is_empty() {
            return Err(GrammarError::new(validator.diagnostics));
        }
        Ok((tree, validation))
    }

    fn lower(
        &mut self,
        text: &str,
        tree: &ExprNode,
        validation: &Validation,
        options: &ParseOptions,
    ) -> Result<CompiledExpression, GrammarError> {
        self.last_datatype = validation.last_datatype;
        let mut transformer = Transformer::new(text, &self.lowered, self.dialect, self.today);
        transformer.convert_dates_with = options.convert_dates_with.clone();
        transformer.convert_datetimes_with = options.convert_datetimes_with.clone();
        let lowered = transformer.transform(tree)?;

        // A bare literal can not be labelled into a query.
        let expr = match lowered.val {
            super::transform::Lowered::Scalar(_) => {
                return Err(GrammarError::message(
                    "Must return an expression, not a constant value",
                ));
            }
            super::transform::Lowered::Sql(expr) => expr,
        };

        let expr = if options.enforce_aggregation
            && !validation.found_aggregation
            && validation.last_datatype == Some(Datatype::Num)
        {
            SqlExpr::func("sum", vec![expr])
        } else {
            expr
        };

        Ok(CompiledExpression {
            expr,
            datatype: validation.last_datatype,
        })
    }

    /// Push the accumulated tree cache back into the injected store.
    pub fn save_cache(&self) {
        let (Some(cache), Some(trees)) = (&self.cache, &self.cached_trees) else {
            return;
        };
        match serde_json::to_string(trees) {
            Ok(blob) => {
                if let Err(error) = cache.set(&self.cache_key, blob) {
                    tracing::warn!(%error, "tree cache write failed");
                }
            }
            Err(error) => tracing::warn!(%error, "tree cache serialization failed"),
        }
    }
}
