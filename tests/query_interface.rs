use std::sync::Arc;
use std::time::Duration;

use tessera::TesseraError;
use tessera::construct::Database;
use tessera::interface::{Outcome, QueryInterface, QueryOptions};
use tessera::persist::PersistenceMode;

fn interface() -> (QueryInterface, Vec<u64>) {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let mut adults = Vec::new();
    for age in [12, 25, 40, 67] {
        let person = db.create("person", false).unwrap();
        db.add_property_value(person, "age", age, false).unwrap();
        if age >= 18 {
            adults.push(person);
        }
    }
    adults.sort_unstable();
    (QueryInterface::new(Arc::new(db)), adults)
}

#[test]
fn results_stream_back_from_a_worker() {
    let (queries, adults) = interface();
    let handle = queries
        .start_query("person", "age >= 18", QueryOptions::default())
        .expect("start");
    let id = handle.id;
    let streamed: Vec<u64> = handle.results.iter().collect();
    assert_eq!(handle.join().unwrap(), (Outcome::Completed, adults.len()));
    assert_eq!(streamed, adults);
    // finished queries are no longer cancellable
    assert!(!queries.cancel(id));
    assert_eq!(queries.active_queries(), 0);
}

#[test]
fn synchronous_runs_match_background_runs() {
    let (queries, adults) = interface();
    assert_eq!(queries.run_sync("person", "age >= 18").unwrap(), adults);
}

#[test]
fn syntax_errors_are_reported_before_starting() {
    let (queries, _) = interface();
    assert!(matches!(
        queries.start_query("person", "age >=", QueryOptions::default()),
        Err(TesseraError::Syntax { .. })
    ));
    assert_eq!(queries.active_queries(), 0);
}

#[test]
fn an_elapsed_timeout_stops_the_query() {
    let (queries, _) = interface();
    let handle = queries
        .start_query(
            "person",
            "age >= 18",
            QueryOptions {
                timeout: Some(Duration::ZERO),
            },
        )
        .expect("start");
    let streamed: Vec<u64> = handle.results.iter().collect();
    assert!(streamed.is_empty());
    assert_eq!(handle.join().unwrap(), (Outcome::TimedOut, 0));
}

#[test]
fn a_cancelled_handle_reports_it() {
    let (queries, _) = interface();
    let handle = queries
        .start_query("person", "age >= 18", QueryOptions::default())
        .expect("start");
    handle.cancel();
    let (outcome, sent) = handle.join().unwrap();
    // the worker may already have finished before observing the cancellation
    assert!(outcome == Outcome::Cancelled || (outcome == Outcome::Completed && sent == 3));
}
