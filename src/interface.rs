//! Threaded interface for submitting and controlling criteria queries.
//!
//! This module provides a minimal, thread-per-query runner that evaluates
//! criteria against a class on a background thread and streams the matching
//! object ids back over a channel. It uses cooperative cancellation via an
//! `Arc<AtomicBool>`, checked before evaluation and between streamed results.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::construct::{Database, ObjectId, normalize_class};
use crate::criteria::Criteria;
use crate::error::{Result, TesseraError};

/// Cancellation token shared with the worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Opaque query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

/// How a query run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    TimedOut,
}

/// Handle to a running or completed query.
pub struct QueryHandle {
    pub id: QueryId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<Result<(Outcome, usize)>>>,
    pub results: Receiver<ObjectId>,
}
impl QueryHandle {
    /// Request cancellation (cooperative). The worker may take a short time to observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the query to finish, returning how it ended and how many ids were sent.
    pub fn join(mut self) -> Result<(Outcome, usize)> {
        match self.join.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| TesseraError::Invariant("query worker panicked".to_string()))?,
            None => Err(TesseraError::Invariant("query already joined".to_string())),
        }
    }
    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Query submission options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
}

/// Registry managing query lifecycles.
pub struct QueryInterface {
    db: Arc<Database>,
    next_id: Mutex<u64>,
    active: Arc<Mutex<HashMap<QueryId, CancelToken>>>,
}

impl QueryInterface {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allocate_id(&self) -> Result<QueryId> {
        let mut next = self.next_id.lock()?;
        *next += 1;
        Ok(QueryId(*next))
    }

    /// Submit criteria for evaluation on a background thread. Syntax errors are
    /// reported here, before any thread is started.
    pub fn start_query(
        &self,
        class: &str,
        criteria: &str,
        options: QueryOptions,
    ) -> Result<QueryHandle> {
        let compiled = Criteria::compile(criteria)?;
        let class = normalize_class(class);
        let id = self.allocate_id()?;
        let cancel = CancelToken::new();
        self.active.lock()?.insert(id, cancel.clone());

        let (tx, rx) = mpsc::channel();
        let db = Arc::clone(&self.db);
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);
        let join = std::thread::spawn(move || {
            let expired = || deadline.is_some_and(|deadline| Instant::now() >= deadline);
            let run = || -> Result<(Outcome, usize)> {
                if cancel_for_thread.is_cancelled() {
                    return Ok((Outcome::Cancelled, 0));
                }
                if expired() {
                    return Ok((Outcome::TimedOut, 0));
                }
                let objects = db.evaluate(&class, &compiled)?;
                let mut sent = 0;
                for object in objects.iter() {
                    if cancel_for_thread.is_cancelled() {
                        return Ok((Outcome::Cancelled, sent));
                    }
                    if expired() {
                        return Ok((Outcome::TimedOut, sent));
                    }
                    if tx.send(object).is_err() {
                        // receiver dropped, nobody is listening anymore
                        return Ok((Outcome::Cancelled, sent));
                    }
                    sent += 1;
                }
                Ok((Outcome::Completed, sent))
            };
            let result = run();
            match &result {
                Ok((outcome, sent)) => debug!(?id, ?outcome, sent, "query finished"),
                Err(e) => warn!(?id, error = %e, "query failed"),
            }
            if let Ok(mut active) = active.lock() {
                active.remove(&id);
            }
            result
        });

        Ok(QueryHandle {
            id,
            cancel,
            started,
            join: Some(join),
            results: rx,
        })
    }

    /// Evaluate criteria synchronously on the current thread.
    pub fn run_sync(&self, class: &str, criteria: &str) -> Result<Vec<ObjectId>> {
        self.db.objects_of_class_that_meet_criteria(class, criteria)
    }

    /// Cancel a query by id.
    pub fn cancel(&self, id: QueryId) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Number of queries still running.
    pub fn active_queries(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or_default()
    }
}
