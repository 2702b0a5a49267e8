//! Extension behavior through the full recipe path: automatic filter
//! laws, pagination boundaries, anonymization, summarization, and
//! blending.

mod common;

use ladle::extensions::{Anonymize, AutomaticFilters, BlendRecipe, CompareRecipe, Paginate, SummarizeOver};
use ladle::{BadRecipe, Recipe, Value};

use common::{census_shelf, census_table, sqlite_session};

fn base_recipe() -> Recipe {
    Recipe::new(census_shelf("sqlite"))
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
}

#[test]
fn test_json_encoded_filters_match_structured() {
    let structured = serde_json::json!({"state": ["Vermont", "Tennessee"]});
    let encoded = serde_json::json!({"state": "[\"Vermont\", \"Tennessee\"]"});

    let mut sqls = Vec::new();
    for filters in [structured, encoded] {
        let mut ext = AutomaticFilters::new();
        ext.automatic_filters(filters.as_object().unwrap().clone());
        let mut recipe = base_recipe()
            .session(sqlite_session())
            .with_extension(Box::new(ext));
        sqls.push(recipe.to_sql().unwrap());
    }
    assert_eq!(sqls[0], sqls[1]);
}

#[test]
fn test_nonstrict_unknown_key_keeps_sql_identical() {
    let mut plain = base_recipe().session(sqlite_session());
    let baseline = plain.to_sql().unwrap();

    let mut ext = AutomaticFilters::new();
    ext.strict_automatic_filters(false);
    ext.automatic_filters(
        serde_json::json!({"mystery": "value"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let mut recipe = base_recipe()
        .session(sqlite_session())
        .with_extension(Box::new(ext));
    assert_eq!(recipe.to_sql().unwrap(), baseline);
}

#[test]
fn test_strict_unknown_key_is_bad_recipe() {
    let mut ext = AutomaticFilters::new();
    ext.automatic_filters(
        serde_json::json!({"mystery": "value"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let mut recipe = base_recipe()
        .session(sqlite_session())
        .with_extension(Box::new(ext));
    assert!(matches!(recipe.query(), Err(BadRecipe::NotOnShelf(_))));
}

#[test]
fn test_empty_filter_list_matches_nothing() {
    let mut ext = AutomaticFilters::new();
    ext.automatic_filters(serde_json::json!({"state": []}).as_object().unwrap().clone());
    let mut recipe = base_recipe()
        .session(sqlite_session())
        .with_extension(Box::new(ext));
    let sql = recipe.to_sql().unwrap();
    assert!(sql.contains("WHERE 1 != 1"), "{sql}");
}

#[test]
fn test_pagination_clamps_past_last_page() {
    let session = sqlite_session();
    session.push_rows(&["count"], vec![vec![Value::Num(23.0)]]);

    let mut paginate = Paginate::new();
    paginate.pagination_page_size(10).pagination_page(7);
    let mut recipe = base_recipe()
        .session(session)
        .with_extension(Box::new(paginate));
    let sql = recipe.to_sql().unwrap();
    // 23 items, page size 10 -> last page is 3 -> offset 20.
    assert!(sql.ends_with("LIMIT 10 OFFSET 20"), "{sql}");

    let info = recipe
        .extension::<Paginate>()
        .unwrap()
        .validated_pagination()
        .unwrap();
    assert_eq!(info.requested_page, 7);
    assert_eq!(info.page, 3);
    assert_eq!(info.page_size, 10);
    assert_eq!(info.total_items, 23);
}

#[test]
fn test_anonymize_toggle_changes_rows_not_sql() {
    let tree = serde_json::json!({
        "_version": "2",
        "state": {"kind": "dimension", "field": "state", "anonymizer": "name"},
        "pop2000": {"kind": "metric", "field": "sum(pop2000)"},
    });
    let shelf = ladle::shelf_from_config(&tree, &census_table(), "sqlite").unwrap();

    let session = sqlite_session();
    session.push_rows(
        &["state_raw", "pop2000"],
        vec![vec![Value::Str("Tennessee".into()), Value::Num(1.0)]],
    );
    let mut anonymize = Anonymize::new();
    anonymize.anonymize(true);
    let mut recipe = Recipe::new(shelf)
        .session(session)
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
        .with_extension(Box::new(anonymize));

    // With anonymization on, the dimension selects its raw column and
    // the formatted value is a stable pseudonym.
    let sql = recipe.to_sql().unwrap();
    assert!(sql.contains("census.state AS state_raw"), "{sql}");
    let rows = recipe.all().unwrap();
    let masked = rows[0].get("state").unwrap().clone();
    assert_ne!(masked, Value::Str("Tennessee".into()));
    // The raw value is still reachable.
    assert_eq!(
        rows[0].get("state_raw"),
        Some(&Value::Str("Tennessee".into()))
    );
}

#[test]
fn test_summarize_over_collapses_dimension() {
    let mut summarize = SummarizeOver::new();
    summarize.summarize_over("sex");
    let mut recipe = Recipe::new(census_shelf("sqlite"))
        .session(sqlite_session())
        .dimensions(&["state", "sex"])
        .unwrap()
        .metrics(&["pop2000"])
        .unwrap()
        .with_extension(Box::new(summarize));
    let sql = recipe.to_sql().unwrap();
    assert!(
        sql.starts_with("SELECT summarize.state AS state, sum(summarize.pop2000) AS pop2000"),
        "{sql}"
    );
    assert!(sql.contains("FROM (SELECT census.state AS state"), "{sql}");
    assert_eq!(recipe.dimension_ids(), vec!["state".to_string()]);
}

#[test]
fn test_blend_and_compare_share_sql_shape() {
    let other = Recipe::new(census_shelf("sqlite"))
        .session(sqlite_session())
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2008"])
        .unwrap();
    let mut blend = BlendRecipe::new();
    blend.blend(other, "state", "state");
    let mut recipe = base_recipe()
        .session(sqlite_session())
        .with_extension(Box::new(blend));
    let blend_sql = recipe.to_sql().unwrap();
    assert!(blend_sql.contains("JOIN (SELECT"), "{blend_sql}");
    assert!(
        blend_sql.contains("ON census.state = blend_1.state"),
        "{blend_sql}"
    );

    let other = Recipe::new(census_shelf("sqlite"))
        .session(sqlite_session())
        .dimensions(&["state"])
        .unwrap()
        .metrics(&["pop2008"])
        .unwrap();
    let mut compare = CompareRecipe::new();
    compare.compare(other);
    let mut recipe = base_recipe()
        .session(sqlite_session())
        .with_extension(Box::new(compare));
    let compare_sql = recipe.to_sql().unwrap();
    assert!(
        compare_sql.contains("avg(compare_1.pop2008) AS pop2008_compare"),
        "{compare_sql}"
    );
    assert!(compare_sql.contains("LEFT OUTER JOIN"), "{compare_sql}");
}

#[test]
fn test_recipe_from_config_with_extensions() {
    let obj = serde_json::json!({
        "dimensions": ["state"],
        "metrics": ["pop2000"],
        "automatic_filters": {"state": "Tennessee"},
        "pagination_page_size": 10,
    });
    let session = sqlite_session();
    session.push_rows(&["count"], vec![vec![Value::Num(1.0)]]);
    let mut recipe = Recipe::from_config(
        census_shelf("sqlite"),
        &obj,
        vec![
            Box::new(AutomaticFilters::new()),
            Box::new(Paginate::new()),
        ],
    )
    .unwrap()
    .session(session);
    let sql = recipe.to_sql().unwrap();
    assert!(sql.contains("WHERE census.state = 'Tennessee'"), "{sql}");
    assert!(sql.ends_with("LIMIT 10"), "{sql}");
}
