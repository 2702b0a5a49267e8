//! Shared fixtures for integration tests: the census table, a
//! standard shelf over it, and a scripted session.

// Each integration test crate uses a different subset of this module.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ladle::{
    QueryResult, Selectable, Session, SessionError, Shelf, StorageType, Value, shelf_from_config,
};

/// A scripted session: records executed SQL and plays back canned
/// results in order, returning empty result sets when the script runs
/// out.
pub struct FakeSession {
    drivername: String,
    executed: Mutex<Vec<String>>,
    results: Mutex<Vec<QueryResult>>,
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

    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.push_result(QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            saved_to_cache: true,
        });
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn last_sql(&self) -> String {
        self.executed
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
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

pub fn census_table() -> Selectable {
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

pub fn census_shelf(drivername: &str) -> Shelf {
    let tree = serde_json::json!({
        "_version": "2",
        "state": {"kind": "dimension", "field": "state"},
        "sex": {"kind": "dimension", "field": "sex"},
        "age": {"kind": "dimension", "field": "age"},
        "pop2000": {"kind": "metric", "field": "sum(pop2000)"},
        "pop2008": {"kind": "metric", "field": "sum(pop2008)"},
    });
    shelf_from_config(&tree, &census_table(), drivername).expect("census shelf builds")
}

pub fn sqlite_session() -> Arc<FakeSession> {
    Arc::new(FakeSession::new("sqlite"))
}
