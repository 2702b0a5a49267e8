//! Grammar emission and hashing.
//!
//! The grammar text is the identity of a catalog: column terminals plus
//! the fixed rule body. Its hash keys the process-wide parser cache and
//! the injected tree cache, and must change exactly when the multiset
//! of `(datatype, name, namespace)` triples changes.

use sha2::{Digest, Sha256};

use super::catalog::ColCollection;
use crate::datatype::Datatype;

/// Emit the column-terminal section, one rule per column, sorted.
fn make_columns_grammar(cc: &ColCollection) -> String {
    let mut rules: Vec<String> = cc.columns.iter().map(|c| c.as_rule()).collect();
    rules.sort();
    rules.join("\n")
}

/// Build a datatype union rule over the catalog's matching column
/// terminals plus the additional rules for that datatype.
fn gather_columns(
    rule_name: &str,
    cc: &ColCollection,
    datatype: Datatype,
    additional_rules: &[&str],
) -> String {
    let count = cc.of_datatype(datatype).count();
    let mut alternatives: Vec<String> = (0..count).map(|n| format!("{datatype}_{n}")).collect();
    alternatives.extend(additional_rules.iter().map(|s| s.to_string()));
    if alternatives.is_empty() {
        return format!("{rule_name}: \"DUMMYVALUNUSABLECOL\"");
    }
    let raw_name = rule_name.split('.').next().unwrap_or(rule_name);
    alternatives.push(format!("\"(\" {raw_name} \")\""));
    format!("{rule_name}: {}", alternatives.join(" | "))
}

/// Emit the full grammar for a catalog.
pub fn make_grammar(cc: &ColCollection) -> String {
    format!(
        r#"col: boolean | string | num | date | datetime_end | datetime | unusable_col | unknown_col | error_math | error_vector_expr | error_not_nonboolean | error_between_expr | error_aggr | error_if_statement

// These are the raw columns in the selectable
{columns}

{unusable}
{date}
{datetime}
{datetime_end}
{boolean}
{string}
{num}
string_add: string "+" string
num_add.1: num "+" num | "(" num "+" num ")"
num_sub.1: num "-" num | "(" num "-" num ")"
num_mul.2: num "*" num | "(" num "*" num ")"
num_div.2: num "/" num | "(" num "/" num ")"

// Low priority matching of unknown column names and bad math
unknown_col.0: "[" NAME "]" | NAME
error_math.0: error_add | error_sub | error_mul | error_div
error_add.0: col "+" col
error_sub.0: col "-" col
error_mul.0: col "*" col
error_div.0: col "/" col
error_between_expr.0: col BETWEEN col AND col
error_vector_expr.0: col vector_comparator mixedarray
error_not_nonboolean: NOT string | NOT num

// Boolean scalar expressions
paren_boolean.5: "(" boolean ")"
not_boolean.4: NOT boolean
and_boolean.3: boolean AND boolean
or_boolean.2: boolean OR boolean
bool_expr: col comparator col | col null_comparator NULL
str_like_expr: string LIKE ESCAPED_STRING
intelligent_date_expr.1: date IS INTELLIGENT_DATE_OFFSET INTELLIGENT_DATE_UNITS
intelligent_datetime_expr.1: datetime IS INTELLIGENT_DATE_OFFSET INTELLIGENT_DATE_UNITS
between_expr.1: string BETWEEN string AND string | num BETWEEN num AND num | date BETWEEN date AND date | datetime BETWEEN datetime AND datetime_end
vector_expr.1: string vector_comparator stringarray | num vector_comparator numarray

// Date conversions and intrinsics
date_conv.3: /date/i "(" ESCAPED_STRING ")"
date_fn.3: /date/i "(" num "," num "," num ")"
datetime_conv.2: /datetime/i "(" ESCAPED_STRING ")"
day_conv: /day/i "(" (date | datetime) ")"
week_conv: /week/i "(" (date | datetime) ")"
month_conv: /month/i "(" (date | datetime) ")"
quarter_conv: /quarter/i "(" (date | datetime) ")"
year_conv: /year/i "(" (date | datetime) ")"
string_cast: /string/i "(" col ")"
string_substr: /substr/i "(" string "," [num ("," num)?] ")"
int_cast: /int/i "(" col ")"
age_conv: /age/i "(" (date | datetime) ")"
coalesce: /coalesce/i "(" col "," col ")"

// Aggregations
error_aggr.0: /sum|min|max|avg|average|median|percentile\d\d?/i "(" col ")"
aggr.1: /sum|min|max|avg|average|count|count_distinct|median|percentile\d\d?/i "(" (col | star) ")"
star: "*"

// functions
if_statement.4: IF "(" (boolean "," (col | NULL) ","?)+ (col | NULL)? ")"
error_if_statement.3: IF "(" (col "," (col | NULL) ","?)+ (col | NULL)? ")"

TRUE: /TRUE/i
FALSE: /FALSE/i
OR: /OR/i
AND: /AND/i
NOT: /NOT/i
IN: /IN/i
IS: /IS/i
BETWEEN: /BETWEEN/i
NULL: /NULL/i
IF: /IF/i
LIKE: /i?like/i
INTELLIGENT_DATE_OFFSET: /prior/i | /last/i | /previous/i | /current/i | /this/i | /next/i
INTELLIGENT_DATE_UNITS: /ytd/i | /year/i | /qtr/i | /month/i | /mtd/i | /day/i
COMMENT: /#.*/
"#,
        columns = make_columns_grammar(cc),
        unusable = gather_columns("unusable_col", cc, Datatype::Unusable, &[]),
        date = gather_columns(
            "date.1",
            cc,
            Datatype::Date,
            &[
                "date_conv",
                "date_fn",
                "day_conv",
                "week_conv",
                "month_conv",
                "quarter_conv",
                "year_conv",
                "date_aggr",
                "date_if_statement",
                "date_coalesce",
            ],
        ),
        datetime = gather_columns(
            "datetime.2",
            cc,
            Datatype::Datetime,
            &["datetime_conv", "datetime_if_statement", "datetime_coalesce"],
        ),
        datetime_end = gather_columns(
            "datetime_end.1",
            cc,
            Datatype::Datetime,
            &["datetime_end_conv", "datetime_aggr"],
        ),
        boolean = gather_columns(
            "boolean.1",
            cc,
            Datatype::Bool,
            &[
                "TRUE",
                "FALSE",
                "bool_expr",
                "str_like_expr",
                "vector_expr",
                "between_expr",
                "not_boolean",
                "or_boolean",
                "and_boolean",
                "paren_boolean",
                "intelligent_date_expr",
                "intelligent_datetime_expr",
            ],
        ),
        string = gather_columns(
            "string.1",
            cc,
            Datatype::Str,
            &[
                "ESCAPED_STRING",
                "string_add",
                "string_cast",
                "string_coalesce",
                "string_substr",
                "string_if_statement",
                "string_aggr",
            ],
        ),
        num = gather_columns(
            "num.1",
            cc,
            Datatype::Num,
            &[
                "NUMBER",
                "num_add",
                "num_sub",
                "num_mul",
                "num_div",
                "int_cast",
                "num_coalesce",
                "aggr",
                "num_if_statement",
                "age_conv",
            ],
        ),
    )
}

/// Hex digest of the grammar text.
pub fn grammar_hash(grammar: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(grammar.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A short ASCII cache key from arbitrary string parts.
pub fn make_key<'a>(prefix: &str, parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = format!("{prefix}:");
    for byte in &digest[..12] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::StorageType;
    use crate::expression::catalog::ColCollection;
    use crate::session::Selectable;

    fn catalog(columns: Vec<(&'static str, StorageType)>) -> ColCollection {
        let sel = Selectable::table("t", columns);
        let mut cc = ColCollection::for_selectable(&sel, None);
        cc.assign_indexes();
        cc
    }

    #[test]
    fn test_grammar_contains_column_terminals() {
        let cc = catalog(vec![
            ("username", StorageType::Text),
            ("score", StorageType::Integer),
        ]);
        let grammar = make_grammar(&cc);
        assert!(grammar.contains("str_0: \"[\" /username/i \"]\" | /username/i"));
        assert!(grammar.contains("num_0: \"[\" /score/i \"]\" | /score/i"));
        assert!(grammar.contains("num.1: num_0 | NUMBER"));
    }

    #[test]
    fn test_empty_datatype_gets_dummy_rule() {
        let cc = catalog(vec![("username", StorageType::Text)]);
        let grammar = make_grammar(&cc);
        assert!(grammar.contains("unusable_col: \"DUMMYVALUNUSABLECOL\""));
    }

    #[test]
    fn test_hash_depends_only_on_column_triples() {
        // Same columns declared in a different order hash identically.
        let a = catalog(vec![
            ("state", StorageType::Text),
            ("age", StorageType::Integer),
        ]);
        let b = catalog(vec![
            ("age", StorageType::Integer),
            ("state", StorageType::Text),
        ]);
        assert_eq!(grammar_hash(&make_grammar(&a)), grammar_hash(&make_grammar(&b)));

        let c = catalog(vec![
            ("state", StorageType::Text),
            ("age", StorageType::Float),
        ]);
        assert_eq!(grammar_hash(&make_grammar(&a)), grammar_hash(&make_grammar(&c)));

        let d = catalog(vec![
            ("state", StorageType::Text),
            ("age2", StorageType::Integer),
        ]);
        assert_ne!(grammar_hash(&make_grammar(&a)), grammar_hash(&make_grammar(&d)));
    }

    #[test]
    fn test_make_key_is_short_ascii() {
        let key = make_key("parsed-field", ["sum(a)", "true", "false"]);
        assert!(key.starts_with("parsed-field:"));
        assert!(key.len() < 64);
        assert!(key.is_ascii());
    }
}
