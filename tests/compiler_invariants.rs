//! Compiler-level invariants: grammar hashing, cache behavior,
//! deterministic SQL emission, and intelligent date properties.

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use ladle::expression::calc_date_range;
use ladle::expression::{BuilderConfig, ExpressionBuilder, ParseOptions, grammar_hash, make_grammar};
use ladle::expression::catalog::ColCollection;
use ladle::{Dialect, MemoryCache, Selectable, StorageType};
use proptest::prelude::*;

use common::census_table;

fn catalog_for(columns: Vec<(&'static str, StorageType)>) -> ColCollection {
    let selectable = Selectable::table("t", columns);
    let mut cc = ColCollection::for_selectable(&selectable, None);
    cc.assign_indexes();
    cc
}

#[test]
fn test_grammar_hash_depends_only_on_column_triples() {
    let a = catalog_for(vec![
        ("state", StorageType::Text),
        ("age", StorageType::Integer),
        ("dt", StorageType::Date),
    ]);
    let b = catalog_for(vec![
        ("dt", StorageType::Date),
        ("state", StorageType::Varchar),
        ("age", StorageType::Bigint),
    ]);
    // Declaration order and concrete storage flavor are invisible;
    // only the (datatype, name, namespace) multiset matters.
    assert_eq!(grammar_hash(&make_grammar(&a)), grammar_hash(&make_grammar(&b)));

    let c = catalog_for(vec![
        ("state", StorageType::Text),
        ("age", StorageType::Integer),
        ("dt", StorageType::Timestamp),
    ]);
    assert_ne!(grammar_hash(&make_grammar(&a)), grammar_hash(&make_grammar(&c)));
}

#[test]
fn test_second_compile_consults_cache() {
    let cache = Arc::new(MemoryCache::new());
    let field = "sum(pop2000) / count(*)";

    let config = BuilderConfig {
        cache: Some(cache.clone()),
        ..Default::default()
    };
    let mut builder =
        ExpressionBuilder::with_config(&census_table(), "postgresql+psycopg2", config).unwrap();
    let first = builder.parse(field, &ParseOptions::default()).unwrap();
    builder.save_cache();

    let config = BuilderConfig {
        cache: Some(cache.clone()),
        ..Default::default()
    };
    let mut builder =
        ExpressionBuilder::with_config(&census_table(), "postgresql+psycopg2", config).unwrap();
    let second = builder.parse(field, &ParseOptions::default()).unwrap();

    assert_eq!(
        first.expr.sql(Dialect::Postgres),
        second.expr.sql(Dialect::Postgres)
    );
    assert_eq!(first.datatype, second.datatype);
}

#[test]
fn test_cache_failures_are_swallowed() {
    use ladle::{CacheError, ShelfCache};

    struct ExplodingCache;

    impl ShelfCache for ExplodingCache {
        fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError("backend unavailable".to_string()))
        }

        fn set(&self, _key: &str, _value: String) -> Result<(), CacheError> {
            Err(CacheError("backend unavailable".to_string()))
        }
    }

    let config = BuilderConfig {
        cache: Some(Arc::new(ExplodingCache)),
        ..Default::default()
    };
    let mut builder =
        ExpressionBuilder::with_config(&census_table(), "sqlite", config).unwrap();
    let compiled = builder
        .parse("sum(pop2000)", &ParseOptions::default())
        .unwrap();
    assert_eq!(compiled.expr.sql(Dialect::Sqlite), "sum(census.pop2000)");
    builder.save_cache();
}

#[test]
fn test_division_identities() {
    let mut builder = ExpressionBuilder::new(&census_table(), "sqlite").unwrap();

    // a / 1 is the identity: no CASE wrap.
    let compiled = builder
        .parse("pop2000 / 1", &ParseOptions::default())
        .unwrap();
    assert_eq!(compiled.expr.sql(Dialect::Sqlite), "census.pop2000");

    // a / 0 is a grammar error.
    assert!(builder.parse("pop2000 / 0", &ParseOptions::default()).is_err());

    // a / b with a non-literal divisor takes the safe-division form.
    let compiled = builder
        .parse("pop2000 / pop2008", &ParseOptions::default())
        .unwrap();
    let sql = compiled.expr.sql(Dialect::Sqlite);
    assert!(sql.starts_with("CASE WHEN census.pop2008 = 0 THEN NULL"), "{sql}");
}

#[test]
fn test_diagnostics_carry_caret_snippets() {
    let mut builder = ExpressionBuilder::new(&census_table(), "sqlite").unwrap();
    let err = builder
        .parse("state + pop2000", &ParseOptions::default())
        .unwrap_err();
    let rendered = err.to_string();
    assert!(
        rendered.contains("string and num can not be added together"),
        "{rendered}"
    );
    assert!(rendered.contains("state + pop2000"), "{rendered}");
    assert!(rendered.contains('^'), "{rendered}");
}

proptest! {
    /// Intelligent date ranges are always ordered and contain the
    /// anchor day for current-period units.
    #[test]
    fn prop_calc_date_range_ordered(
        offset in prop::sample::select(vec!["prior", "last", "previous", "current", "this", "next"]),
        unit in prop::sample::select(vec!["year", "ytd", "qtr", "month", "mtd", "day"]),
        year in 1990i32..2100,
        ordinal in 0u32..365,
    ) {
        let today = NaiveDate::from_ymd_opt(year, 1, 1).unwrap()
            + chrono::Duration::days(ordinal as i64);
        let (start, end) = calc_date_range(offset, unit, today).unwrap();
        prop_assert!(start <= end);
        if matches!(offset, "current" | "this") {
            prop_assert!(start <= today && today <= end);
        }
    }

    /// All prior offsets are aliases, as are current ones.
    #[test]
    fn prop_offset_aliases_agree(
        unit in prop::sample::select(vec!["year", "ytd", "qtr", "month", "mtd", "day"]),
        year in 1990i32..2100,
        ordinal in 0u32..365,
    ) {
        let today = NaiveDate::from_ymd_opt(year, 1, 1).unwrap()
            + chrono::Duration::days(ordinal as i64);
        let prior = calc_date_range("prior", unit, today).unwrap();
        prop_assert_eq!(calc_date_range("last", unit, today).unwrap(), prior);
        prop_assert_eq!(calc_date_range("previous", unit, today).unwrap(), prior);
        let current = calc_date_range("current", unit, today).unwrap();
        prop_assert_eq!(calc_date_range("this", unit, today).unwrap(), current);
    }

    /// Compiling the same field twice always yields identical SQL.
    #[test]
    fn prop_compile_is_deterministic(
        field in prop::sample::select(vec![
            "sum(pop2000)",
            "sum(pop2000) / count(*)",
            "age + 1",
            "state",
            "if(age < 2, \"babies\", \"oldsters\")",
            "state in (\"Tennessee\", \"Vermont\")",
        ]),
    ) {
        let mut a = ExpressionBuilder::new(&census_table(), "sqlite").unwrap();
        let mut b = ExpressionBuilder::new(&census_table(), "sqlite").unwrap();
        let left = a.parse(field, &ParseOptions::default()).unwrap();
        let right = b.parse(field, &ParseOptions::default()).unwrap();
        prop_assert_eq!(
            left.expr.sql(Dialect::Sqlite),
            right.expr.sql(Dialect::Sqlite)
        );
    }
}
