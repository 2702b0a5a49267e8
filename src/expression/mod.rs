//! The expression compiler.
//!
//! Catalog → grammar → parse → validate → lower, with parser and tree
//! caches. [`builder::ExpressionBuilder`] is the entry point; the
//! submodules are the pipeline stages in order.

pub mod ast;
pub mod builder;
pub mod catalog;
pub mod dates;
pub mod grammar;
pub mod lexer;
pub mod parser;
pub mod transform;
pub mod validate;

pub use builder::{BuilderConfig, CompiledExpression, ExpressionBuilder, ParseOptions};
pub use catalog::{Col, ColCollection, is_valid_column};
pub use dates::calc_date_range;
pub use grammar::{grammar_hash, make_grammar};
