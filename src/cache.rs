//! Snapshot caches.
//!
//! A cache only stores and hands back snapshots. Whether a cached snapshot may
//! be used is decided by the database, which compares the object's last
//! revision time against its last cache time before asking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::construct::{IdHasher, ObjectId, Snapshot};
use crate::error::Result;
use crate::persist::{Persistor, Predicate, SNAPSHOT, object_value, text_value};

pub trait SnapshotCache: Send + Sync {
    fn kind(&self) -> &'static str;
    fn get(&self, object: ObjectId) -> Result<Option<Snapshot>>;
    fn put(&self, object: ObjectId, snapshot: &Snapshot) -> Result<()>;
    fn remove(&self, object: ObjectId) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Keeps snapshots in process memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    kept: Mutex<HashMap<ObjectId, Snapshot, IdHasher>>,
}
impl MemoryCache {
    pub fn len(&self) -> usize {
        self.kept.lock().map(|kept| kept.len()).unwrap_or_default()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl SnapshotCache for MemoryCache {
    fn kind(&self) -> &'static str {
        "memory"
    }
    fn get(&self, object: ObjectId) -> Result<Option<Snapshot>> {
        Ok(self.kept.lock()?.get(&object).cloned())
    }
    fn put(&self, object: ObjectId, snapshot: &Snapshot) -> Result<()> {
        self.kept.lock()?.insert(object, snapshot.clone());
        Ok(())
    }
    fn remove(&self, object: ObjectId) -> Result<()> {
        self.kept.lock()?.remove(&object);
        Ok(())
    }
    fn clear(&self) -> Result<()> {
        self.kept.lock()?.clear();
        Ok(())
    }
}

/// Keeps snapshots as JSON in the backing store, so that every process
/// opening the same database file shares them.
pub struct TableCache {
    persistor: Arc<Mutex<Persistor>>,
}
impl TableCache {
    pub fn new(persistor: Arc<Mutex<Persistor>>) -> Self {
        Self { persistor }
    }
}
impl SnapshotCache for TableCache {
    fn kind(&self) -> &'static str {
        "table"
    }
    fn get(&self, object: ObjectId) -> Result<Option<Snapshot>> {
        let rows = self.persistor.lock()?.select(
            &["Properties"],
            SNAPSHOT,
            &Predicate::object(object),
            true,
        )?;
        match rows.first() {
            Some(row) => Ok(Some(serde_json::from_str(&row.text(0)?)?)),
            None => Ok(None),
        }
    }
    fn put(&self, object: ObjectId, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.persistor.lock()?.execute(
            "insert into Snapshot (Object_Identity, Properties) values (?, ?) \
             on conflict (Object_Identity) do update set Properties = excluded.Properties",
            &[object_value(object), text_value(json)],
        )?;
        Ok(())
    }
    fn remove(&self, object: ObjectId) -> Result<()> {
        self.persistor
            .lock()?
            .delete(SNAPSHOT, &Predicate::object(object))?;
        Ok(())
    }
    fn clear(&self) -> Result<()> {
        self.persistor.lock()?.delete(SNAPSHOT, &Predicate::all())?;
        Ok(())
    }
}

/// Never keeps anything, every load rebuilds.
#[derive(Debug, Default)]
pub struct NoCache;
impl SnapshotCache for NoCache {
    fn kind(&self) -> &'static str {
        "none"
    }
    fn get(&self, _object: ObjectId) -> Result<Option<Snapshot>> {
        Ok(None)
    }
    fn put(&self, _object: ObjectId, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
    fn remove(&self, _object: ObjectId) -> Result<()> {
        Ok(())
    }
    fn clear(&self) -> Result<()> {
        Ok(())
    }
}
