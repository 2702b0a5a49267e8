//! Shared fixtures for unit tests: the census selectable, a standard
//! shelf over it, and a scripted session.

use std::sync::{Arc, Mutex};

use crate::datatype::StorageType;
use crate::error::SessionError;
use crate::session::{QueryResult, Selectable, Session};
use crate::shelf::Shelf;

/// A scripted session: records every executed statement and plays
/// back canned results in order. With no canned results it returns
/// empty result sets.
pub(crate) struct FakeSession {
    drivername: String,
    pub executed: Mutex<Vec<String>>,
    pub results: Mutex<Vec<QueryResult>>,
}

impl FakeSession {
    pub fn new(drivername: &str) -> FakeSession {
        FakeSession {
            drivername: drivername.to_string(),
            executed: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn push_result(&self, result: QueryResult) {
        self.results.lock().unwrap().push(result);
    }

    pub fn last_sql(&self) -> String {
        self.executed
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

impl Session for FakeSession {
    fn drivername(&self) -> &str {
        &self.drivername
    }

    fn execute(&self, sql: &str) -> Result<QueryResult, SessionError> {
        self.executed.lock().unwrap().push(sql.to_string());
        let mut results = self.results.lock().unwrap();
        if results.is_empty() {
            Ok(QueryResult {
                columns: vec![],
                rows: vec![],
                saved_to_cache: true,
            })
        } else {
            Ok(results.remove(0))
        }
    }
}

pub(crate) fn census_selectable() -> Selectable {
    Selectable::table(
        "census",
        [
            ("state", StorageType::Text),
            ("sex", StorageType::Text),
            ("age", StorageType::Integer),
            ("pop2000", StorageType::Integer),
            ("pop2008", StorageType::Integer),
        ],
    )
}

/// The standard census shelf used across recipe and extension tests.
pub(crate) fn census_shelf() -> Shelf {
    let tree = serde_json::json!({
        "_version": "2",
        "state": {"kind": "dimension", "field": "state"},
        "sex": {"kind": "dimension", "field": "sex"},
        "age": {"kind": "dimension", "field": "age"},
        "pop2000": {"kind": "metric", "field": "sum(pop2000)"},
        "pop2008": {"kind": "metric", "field": "sum(pop2008)"},
        "teens": {"kind": "filter", "condition": "age between 13 and 19"},
    });
    crate::config::shelf_from_config(&tree, &census_selectable(), "sqlite").unwrap()
}

pub(crate) fn sqlite_session() -> Arc<FakeSession> {
    Arc::new(FakeSession::new("sqlite"))
}
