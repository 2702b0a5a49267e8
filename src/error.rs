//! Error kinds surfaced by the compiler, the shelf loader, and the
//! recipe assembler.
//!
//! These are tagged results, not a deep hierarchy: `GrammarError` for
//! anything the expression compiler rejects, `BadIngredient` for
//! configuration-level problems, `BadRecipe` for assembly-level problems.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single user-facing compiler diagnostic with a caret snippet
/// pointing into the original field text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    /// Byte offset of the offending token in the source text.
    pub offset: usize,
    /// Two-line excerpt: source context, then a caret under the token.
    pub snippet: String,
}

impl Diagnostic {
    /// Build a diagnostic pointing at `offset` in `text`.
    ///
    /// The snippet shows up to `span` characters of the surrounding line
    /// with a caret under the offending position.
    pub fn at(message: impl Into<String>, text: &str, offset: usize, span: usize) -> Self {
        let offset = offset.min(text.len());
        let start = offset.saturating_sub(span);
        let end = (offset + span).min(text.len());
        // Clamp to char boundaries so slicing never panics on multibyte text.
        let start = floor_char_boundary(text, start);
        let end = floor_char_boundary(text, end);
        let before = text[start..offset].rsplit('\n').next().unwrap_or("");
        let after = text[offset..end].split('\n').next().unwrap_or("");
        let caret_pad = " ".repeat(before.chars().count());
        let snippet = format!("{before}{after}\n{caret_pad}^");
        Diagnostic {
            message: message.into(),
            offset,
            snippet,
        }
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\n{}", self.message, self.snippet)
    }
}

/// The field text did not parse or failed validation.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub struct GrammarError {
    pub diagnostics: Vec<Diagnostic>,
}

impl GrammarError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }

    /// A single-message error without a source location.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            diagnostics: vec![Diagnostic {
                message: message.into(),
                offset: 0,
                snippet: String::new(),
            }],
        }
    }
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for d in &self.diagnostics {
            if !first {
                writeln!(f)?;
            }
            first = false;
            if d.snippet.is_empty() {
                write!(f, "{}", d.message)?;
            } else {
                write!(f, "{d}")?;
            }
        }
        Ok(())
    }
}

/// Configuration-level failure while building an ingredient or a shelf.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BadIngredient {
    #[error("{key} must be defined to make a {kind}")]
    MissingKey { key: String, kind: String },

    #[error("unknown ingredient kind '{0}'")]
    UnknownKind(String),

    #[error("formatters passed to an ingredient must be a list")]
    InvalidFormatters,

    #[error("column_suffixes must be the same length as columns")]
    SuffixCountMismatch,

    #[error("raw is a reserved role in dimensions")]
    ReservedRole,

    #[error("lookup must be a mapping of scalars to scalars")]
    InvalidLookup,

    #[error("reference cycle detected involving '@{0}'")]
    ReferenceCycle(String),

    #[error("'@{0}' does not reference an ingredient in this configuration")]
    UnknownReference(String),

    #[error("invalid ingredient configuration: {0}")]
    InvalidConfig(String),

    #[error("ingredient '{id}' is invalid: {detail}")]
    InvalidUsed { id: String, detail: String },

    #[error(transparent)]
    Compile(#[from] GrammarError),
}

/// Assembly-level failure while composing or running a recipe.
#[derive(Debug, Error)]
pub enum BadRecipe {
    #[error("No ingredients have been added to this recipe")]
    NoIngredients,

    #[error(
        "Recipes must use ingredients that all come from the same table.\n\
         Tables used: {0}"
    )]
    MultipleSources(String),

    #[error("{0} doesn't exist on the shelf")]
    NotOnShelf(String),

    #[error("{id} is not a {expected}")]
    WrongKind { id: String, expected: String },

    #[error("quickselect {name} was not found in ingredient {id}")]
    UnknownQuickselect { name: String, id: String },

    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("AutomaticFilter key {0} is not a dimension on the shelf")]
    UnknownFilterKey(String),

    #[error("When using between, you can only supply a lower and upper bound")]
    BetweenBounds,

    #[error("a scalar value can not be used with the {0} operator")]
    ScalarWithVectorOperator(String),

    #[error("a list value can not be used with the {0} operator")]
    VectorWithScalarOperator(String),

    #[error("Can't access stats before the query has run")]
    StatsNotReady,

    #[error("validated_pagination can only be accessed after the recipe has run")]
    PaginationNotReady,

    #[error("Provide a summary_aggregation for metric {0}")]
    MissingSummaryAggregation(String),

    #[error("{dim} dimension in comparison recipe must exist in base recipe")]
    CompareDimensionMissing { dim: String },

    #[error("Can't find join property for {0} dimension in blend recipe")]
    BlendJoinMissing(String),

    #[error("{0} could not be found in the blend recipe subquery")]
    BlendColumnMissing(String),

    #[error("Directive {0} isn't handled")]
    UnknownDirective(String),

    #[error(transparent)]
    Ingredient(#[from] BadIngredient),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Opaque error surfaced by the execution session.
#[derive(Debug, Error)]
#[error("session error: {0}")]
pub struct SessionError(pub String);

/// Error raised by an injected cache. Always swallowed by the core.
#[derive(Debug, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_caret_alignment() {
        let text = "sum(score) + department";
        let d = Diagnostic::at("department and num can not be added together", text, 13, 200);
        let lines: Vec<&str> = d.snippet.lines().collect();
        assert_eq!(lines[0], text);
        assert_eq!(lines[1], "             ^");
    }

    #[test]
    fn test_diagnostic_clamps_offset() {
        let d = Diagnostic::at("oops", "ab", 99, 40);
        assert_eq!(d.offset, 2);
        assert!(d.snippet.ends_with('^'));
    }

    #[test]
    fn test_diagnostic_stops_at_newlines() {
        let text = "first line\nsecond line\nthird";
        let d = Diagnostic::at("msg", text, 11, 200);
        assert_eq!(d.snippet.lines().next(), Some("second line"));
    }

    #[test]
    fn test_grammar_error_display_joins_diagnostics() {
        let err = GrammarError::new(vec![
            Diagnostic {
                message: "first".into(),
                offset: 0,
                snippet: String::new(),
            },
            Diagnostic {
                message: "second".into(),
                offset: 0,
                snippet: String::new(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }
}
