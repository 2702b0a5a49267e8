//! End-to-end scenarios over the census table: shelf construction,
//! recipe assembly, generated SQL, and enchanted results against a
//! scripted session.

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use ladle::expression::{BuilderConfig, ExpressionBuilder, ParseOptions};
use ladle::{Dialect, Recipe, Value, shelf_from_config_with};

use common::{FakeSession, census_shelf, census_table, sqlite_session};

#[test]
fn test_state_population_rows() -> anyhow::Result<()> {
    let session = sqlite_session();
    session.push_rows(
        &["state", "pop2000"],
        vec![
            vec![Value::Str("Tennessee".into()), Value::Num(5685230.0)],
            vec![Value::Str("Vermont".into()), Value::Num(609480.0)],
        ],
    );

    let mut recipe = Recipe::new(census_shelf("sqlite"))
        .session(session.clone())
        .dimensions(&["state"])?
        .metrics(&["pop2000"])?
        .order_by(&["state"])?;

    assert_eq!(
        recipe.to_sql()?,
        "SELECT census.state AS state, sum(census.pop2000) AS pop2000 \
         FROM census GROUP BY state ORDER BY state"
    );

    let rows = recipe.all()?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("state"), Some(&Value::Str("Tennessee".into())));
    assert_eq!(rows[0].get("pop2000"), Some(&Value::Num(5685230.0)));
    assert_eq!(rows[1].get("state"), Some(&Value::Str("Vermont".into())));
    assert_eq!(rows[1].get("pop2000"), Some(&Value::Num(609480.0)));
    Ok(())
}

#[test]
fn test_age_bucket_dimension_with_ordering() {
    let tree = serde_json::json!({
        "_version": "2",
        "age_group": {
            "kind": "dimension",
            "field": "age",
            "buckets": [
                {"label": "babies", "condition": "age < 2"},
                {"label": "children", "condition": "age < 13"},
                {"label": "teens", "condition": "age < 20"},
            ],
            "buckets_default_label": "oldsters",
        },
        "pop2000": {"kind": "metric", "field": "sum(pop2000)"},
    });
    let shelf = ladle::shelf_from_config(&tree, &census_table(), "sqlite").unwrap();
    let mut recipe = Recipe::new(shelf)
        .session(sqlite_session())
        .dimensions(&["age_group"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
        .order_by(&["age_group"])
        .unwrap();

    let sql = recipe.to_sql().unwrap();
    // The bucket dimension selects the label column and a parallel
    // positional ordering column: 0, 1, 2 and 9999 for the default.
    assert!(
        sql.contains(
            "CASE WHEN census.age < 2 THEN 'babies' WHEN census.age < 13 THEN 'children' \
             WHEN census.age < 20 THEN 'teens' ELSE 'oldsters' END AS age_group"
        ),
        "{sql}"
    );
    assert!(
        sql.contains(
            "CASE WHEN census.age < 2 THEN 0 WHEN census.age < 13 THEN 1 \
             WHEN census.age < 20 THEN 2 ELSE 9999 END AS age_group_order_by"
        ),
        "{sql}"
    );
    // Ordering is driven by the order_by role column.
    assert!(sql.contains("ORDER BY age_group_order_by, age_group"), "{sql}");
}

#[test]
fn test_intelligent_date_filter_lowering() {
    // `dt IS last year` compiles to a literal BETWEEN over the prior
    // calendar year.
    let selectable = ladle::Selectable::table(
        "events",
        [
            ("name", ladle::StorageType::Text),
            ("dt", ladle::StorageType::Date),
        ],
    );
    let config = BuilderConfig {
        today: Some(NaiveDate::from_ymd_opt(2020, 6, 8).unwrap()),
        ..Default::default()
    };
    let mut builder =
        ExpressionBuilder::with_config(&selectable, "postgresql+psycopg2", config).unwrap();
    let compiled = builder
        .parse("dt is last year", &ParseOptions::default())
        .unwrap();
    assert_eq!(
        compiled.expr.sql(Dialect::Postgres),
        "events.dt BETWEEN '2019-01-01' AND '2019-12-31'"
    );
}

#[test]
fn test_safe_division_metric() {
    let tree = serde_json::json!({
        "_version": "2",
        "avg_score": {"kind": "metric", "field": "sum(pop2000) / count(*)"},
    });
    let shelf = ladle::shelf_from_config(&tree, &census_table(), "sqlite").unwrap();
    let mut recipe = Recipe::new(shelf)
        .session(sqlite_session())
        .metrics(&["avg_score"])
        .unwrap();
    let sql = recipe.to_sql().unwrap();
    assert!(
        sql.contains(
            "CASE WHEN count(*) = 0 THEN NULL \
             ELSE CAST(sum(census.pop2000) AS FLOAT) / CAST(count(*) AS FLOAT) END"
        ),
        "{sql}"
    );
}

#[test]
fn test_compound_automatic_filter() {
    use ladle::extensions::AutomaticFilters;

    let mut filters = AutomaticFilters::new();
    filters.automatic_filters(
        serde_json::json!({"state,sex": [["Tennessee", "M"], ["Vermont", "F"]]})
            .as_object()
            .unwrap()
            .clone(),
    );
    let mut recipe = Recipe::new(census_shelf("sqlite"))
        .session(sqlite_session())
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
        .with_extension(Box::new(filters));
    let sql = recipe.to_sql().unwrap();
    assert!(
        sql.contains(
            "WHERE ((census.state = 'Tennessee') AND (census.sex = 'M')) OR \
             ((census.state = 'Vermont') AND (census.sex = 'F'))"
        ),
        "{sql}"
    );
}

#[test]
fn test_paginated_search() {
    use ladle::extensions::Paginate;

    let session = sqlite_session();
    // First the count query, then the page itself.
    session.push_rows(&["count"], vec![vec![Value::Num(50.0)]]);
    session.push_rows(&["state", "sex", "age", "pop2000"], vec![]);

    let mut paginate = Paginate::new();
    paginate
        .pagination_page_size(10)
        .pagination_page(5)
        .pagination_q("T%")
        .pagination_search_keys(vec!["state".to_string(), "sex".to_string()]);

    let mut recipe = Recipe::new(census_shelf("sqlite"))
        .session(session.clone())
        .dimensions(&["state", "sex", "age"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
        .with_extension(Box::new(paginate));

    let sql = recipe.to_sql().unwrap();
    assert!(
        sql.contains(
            "WHERE (lower(census.state) LIKE lower('T%')) OR \
             (lower(census.sex) LIKE lower('T%'))"
        ),
        "{sql}"
    );
    assert!(sql.ends_with("LIMIT 10 OFFSET 40"), "{sql}");
}

#[test]
fn test_lookup_enchantment_and_raw_columns() {
    let tree = serde_json::json!({
        "_version": "2",
        "sex": {
            "kind": "dimension",
            "field": "sex",
            "lookup": {"M": "Male", "F": "Female"},
            "lookup_default": "Unknown",
        },
        "pop2000": {"kind": "metric", "field": "sum(pop2000)"},
    });
    let shelf = ladle::shelf_from_config(&tree, &census_table(), "sqlite").unwrap();
    let session = sqlite_session();
    session.push_rows(
        &["sex_raw", "pop2000"],
        vec![
            vec![Value::Str("F".into()), Value::Num(100.0)],
            vec![Value::Str("X".into()), Value::Num(1.0)],
        ],
    );
    let mut recipe = Recipe::new(shelf)
        .session(session.clone())
        .dimensions(&["sex"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap();

    // A dimension with formatters selects its raw column.
    let sql = recipe.to_sql().unwrap();
    assert!(sql.contains("census.sex AS sex_raw"), "{sql}");

    let rows = recipe.all().unwrap();
    assert_eq!(rows[0].get("sex"), Some(&Value::Str("Female".into())));
    assert_eq!(rows[0].get("sex_id"), Some(&Value::Str("F".into())));
    assert_eq!(rows[1].get("sex"), Some(&Value::Str("Unknown".into())));
}

#[test]
fn test_total_count_matches_all_rows_without_limit() {
    let session = sqlite_session();
    session.push_rows(
        &["state", "pop2000"],
        vec![
            vec![Value::Str("Tennessee".into()), Value::Num(1.0)],
            vec![Value::Str("Vermont".into()), Value::Num(2.0)],
        ],
    );
    session.push_rows(&["count"], vec![vec![Value::Num(2.0)]]);

    let mut recipe = Recipe::new(census_shelf("sqlite"))
        .session(session.clone())
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap();
    let rows = recipe.all().unwrap();
    let total = recipe.total_count().unwrap();
    assert_eq!(rows.len() as u64, total);
}

#[test]
fn test_recipe_as_catalog_source() {
    // A recipe's outer SELECT exposes typed columns for a second
    // catalog.
    let mut inner = Recipe::new(census_shelf("sqlite"))
        .session(sqlite_session())
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap();
    let selectable = inner.as_selectable("inner_totals").unwrap();

    let mut builder = ExpressionBuilder::new(&selectable, "sqlite").unwrap();
    let compiled = builder
        .parse("sum(pop2000)", &ParseOptions::default())
        .unwrap();
    assert_eq!(
        compiled.expr.sql(Dialect::Sqlite),
        "sum(inner_totals.pop2000)"
    );
}

#[test]
fn test_dialect_differences_flow_through_shelf() {
    let tree = serde_json::json!({
        "_version": "2",
        "median_age": {"kind": "metric", "field": "median(age)"},
    });
    let shelf =
        ladle::shelf_from_config(&tree, &census_table(), "bigquery").unwrap();
    let session = Arc::new(FakeSession::new("bigquery"));
    let mut recipe = Recipe::new(shelf)
        .session(session)
        .metrics(&["median_age"])
        .unwrap();
    let sql = recipe.to_sql().unwrap();
    assert!(
        sql.contains("approx_quantiles(census.age, 2)[OFFSET(1)]"),
        "{sql}"
    );
}

#[test]
fn test_constants_in_shelf_config() {
    use std::collections::BTreeMap;

    let mut constants = BTreeMap::new();
    constants.insert("ttlpop".to_string(), Value::Num(281421906.0));
    let config = BuilderConfig {
        constants,
        ..Default::default()
    };
    let tree = serde_json::json!({
        "_version": "2",
        "pop_share": {"kind": "metric", "field": "sum(pop2000) / @constants.ttlpop"},
    });
    let shelf =
        shelf_from_config_with(&tree, &census_table(), "sqlite", config).unwrap();
    let mut recipe = Recipe::new(shelf)
        .session(sqlite_session())
        .metrics(&["pop_share"])
        .unwrap();
    let sql = recipe.to_sql().unwrap();
    assert!(sql.contains("CAST(281421906 AS FLOAT)"), "{sql}");
}
