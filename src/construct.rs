use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

// other keepers use HashSet or HashMap
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

// our own stuff that we need
use crate::cache::{MemoryCache, NoCache, SnapshotCache, TableCache};
use crate::config::{CacheKind, IdStrategy, IdentifierSettings, StoreConfig};
use crate::datatype::{self, Clock, Raw, Timestamp, Value, ValueType};
use crate::error::{Result, TesseraError};
use crate::persist::{
    IDENTIFIER, OBJECT, PROPERTY_VALUE, PersistenceMode, Persistor, Predicate, object_value,
    text_value,
};
use crate::revision::RevisionKind;

// ------------- Object -------------
pub type ObjectId = u64;

pub type IdHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: ObjectId = 0;
const MAX_RANDOM_ID: ObjectId = u32::MAX as ObjectId;

/// The pseudo-property holding the class in loaded snapshots.
pub const CLASS: &str = "class";
/// Reserved for the object identity.
pub const ID: &str = "id";

lazy_static! {
    static ref CLASS_NAME: Regex = Regex::new(r"^[A-Z0-9_]+$").unwrap();
}

fn normalize(name: &str) -> String {
    name.trim().replace([' ', '/', '-'], "_")
}
pub fn normalize_class(class: &str) -> String {
    normalize(class).to_uppercase()
}
pub fn normalize_property(property: &str) -> String {
    normalize(property).to_lowercase()
}

#[derive(Debug)]
pub struct IdAllocator {
    strategy: IdStrategy,
    lower_bound: ObjectId,
    released: Vec<ObjectId>,
    max_attempts: u32,
}

impl IdAllocator {
    pub fn new(strategy: IdStrategy, max_attempts: u32) -> Self {
        Self {
            strategy,
            lower_bound: GENESIS,
            released: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }
    // Identities found in the store, either on startup or through a collision,
    // must never be generated again by the sequential strategy.
    pub fn retain(&mut self, id: ObjectId) {
        if id > self.lower_bound {
            self.lower_bound = id;
        }
    }
    pub fn release(&mut self, id: ObjectId) {
        if self.strategy == IdStrategy::Sequential {
            self.released.push(id);
        }
    }
    pub fn generate(&mut self) -> ObjectId {
        match self.strategy {
            IdStrategy::Random => rand::thread_rng().gen_range(1..=MAX_RANDOM_ID),
            IdStrategy::Sequential => self.released.pop().unwrap_or_else(|| {
                self.lower_bound += 1;
                self.lower_bound
            }),
        }
    }
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ------------- Loaded shapes -------------
/// The values of one property: a scalar when there is one, a list otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    One(Value),
    Many(Vec<Value>),
}
impl Field {
    fn with(self, value: Value) -> Field {
        match self {
            Field::One(first) => Field::Many(vec![first, value]),
            Field::Many(mut values) => {
                values.push(value);
                Field::Many(values)
            }
        }
    }
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Field::One(value) => vec![value],
            Field::Many(values) => values.iter().collect(),
        }
    }
    pub fn one(&self) -> Option<&Value> {
        match self {
            Field::One(value) => Some(value),
            Field::Many(_) => None,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            Field::One(_) => 1,
            Field::Many(values) => values.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every property of an object, including the `class` pseudo-property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    properties: BTreeMap<String, Field>,
}
impl Snapshot {
    pub fn new(class: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(CLASS.to_string(), Field::One(Value::Str(class.to_string())));
        Self { properties }
    }
    pub(crate) fn push(&mut self, property: String, value: Value) {
        let field = match self.properties.remove(&property) {
            Some(field) => field.with(value),
            None => Field::One(value),
        };
        self.properties.insert(property, field);
    }
    pub fn class(&self) -> Option<&str> {
        self.properties
            .get(CLASS)
            .and_then(Field::one)
            .and_then(Value::as_str)
    }
    pub fn get(&self, property: &str) -> Option<&Field> {
        self.properties.get(property)
    }
    pub fn properties(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.properties.iter()
    }
    pub fn len(&self) -> usize {
        self.properties.len()
    }
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
    fn restrict(&self, names: &[String]) -> Snapshot {
        let properties = self
            .properties
            .iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, field)| (name.clone(), field.clone()))
            .collect();
        Snapshot { properties }
    }
}

/// Which properties a load returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Only(Vec<String>),
}
impl Selection {
    pub fn only(properties: &[&str]) -> Self {
        Selection::Only(properties.iter().map(|p| normalize_property(p)).collect())
    }
    /// `*` selects everything, otherwise a comma separated list of properties.
    pub fn parse(list: &str) -> Self {
        if list.trim() == "*" {
            return Selection::All;
        }
        Selection::Only(
            list.split(',')
                .map(normalize_property)
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    Object(Snapshot),
    Field(Option<Field>),
}
impl Loaded {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Loaded::Object(snapshot) => Some(snapshot),
            Loaded::Field(_) => None,
        }
    }
    pub fn field(&self) -> Option<&Field> {
        match self {
            Loaded::Field(field) => field.as_ref(),
            Loaded::Object(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Values are added next to what the target already has.
    Combine,
    /// Copied properties replace the target's values.
    Overwrite,
}

// ------------- Database -------------
// This sets up the database with the necessary structures
pub struct Database {
    // owns the connection to the backing store
    pub(crate) persistor: Arc<Mutex<Persistor>>,
    id_allocator: Mutex<IdAllocator>,
    pub(crate) cache: Box<dyn SnapshotCache>,
    // the value type pinned by the first value of an (object, property) pair
    accepted_types: Mutex<HashMap<(ObjectId, String), ValueType, OtherHasher>>,
    pub(crate) clock: Clock,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Database> {
        Self::open(&mode, CacheKind::default(), &IdentifierSettings::default())
    }
    pub fn from_config(config: &StoreConfig) -> Result<Database> {
        Self::open(&config.database.mode(), config.cache.kind, &config.identifiers)
    }
    pub fn open(
        mode: &PersistenceMode,
        cache: CacheKind,
        identifiers: &IdentifierSettings,
    ) -> Result<Database> {
        let persistor = Persistor::new(mode)?;
        let latest = persistor
            .query(
                "select coalesce(max(max(Last_Cached, Last_Revised)), 0) from Object",
                &[],
            )?
            .first()
            .map(|row| row.integer(0))
            .transpose()?
            .unwrap_or_default();
        let highest = persistor
            .query("select coalesce(max(Identifier), 0) from Identifier", &[])?
            .first()
            .map(|row| row.object(0))
            .transpose()?
            .unwrap_or(GENESIS);
        let mut id_allocator = IdAllocator::new(identifiers.strategy, identifiers.max_attempts);
        id_allocator.retain(highest);

        let persistor = Arc::new(Mutex::new(persistor));
        let cache: Box<dyn SnapshotCache> = match cache {
            CacheKind::Memory => Box::new(MemoryCache::default()),
            CacheKind::Table => Box::new(TableCache::new(Arc::clone(&persistor))),
            CacheKind::None => Box::new(NoCache),
        };
        info!(?mode, cache = cache.kind(), "database ready");
        Ok(Database {
            persistor,
            id_allocator: Mutex::new(id_allocator),
            cache,
            accepted_types: Mutex::new(HashMap::default()),
            clock: Clock::starting_after(latest),
        })
    }
    pub(crate) fn persistor(&self) -> Result<MutexGuard<'_, Persistor>> {
        Ok(self.persistor.lock()?)
    }

    fn allocate_id(&self) -> Result<ObjectId> {
        let mut allocator = self.id_allocator.lock()?;
        for attempt in 1..=allocator.max_attempts() {
            let candidate = allocator.generate();
            let recorded = self.persistor()?.insert_or_ignore(
                IDENTIFIER,
                &["Identifier"],
                &[vec![object_value(candidate)]],
            )?;
            if recorded == 1 {
                return Ok(candidate);
            }
            debug!(candidate, attempt, "identifier already in use");
            allocator.retain(candidate);
        }
        Err(TesseraError::Invariant(format!(
            "no free identifier found in {} attempts",
            allocator.max_attempts()
        )))
    }
    fn release_id(&self, object: ObjectId) -> Result<()> {
        let mut allocator = self.id_allocator.lock()?;
        self.persistor()?
            .delete(IDENTIFIER, &Predicate::eq("Identifier", object_value(object)))?;
        allocator.release(object);
        Ok(())
    }

    pub(crate) fn class_of(&self, object: ObjectId) -> Result<Option<String>> {
        let rows = self
            .persistor()?
            .select(&["Class"], OBJECT, &Predicate::object(object), true)?;
        rows.first().map(|row| row.text(0)).transpose()
    }
    pub(crate) fn require_class(&self, object: ObjectId) -> Result<String> {
        self.class_of(object)?
            .ok_or(TesseraError::NotFound(object))
    }
    fn checked_property(&self, property: &str) -> Result<String> {
        let normalized = normalize_property(property);
        if normalized.is_empty() || normalized == ID || normalized == CLASS {
            return Err(TesseraError::InvalidProperty(property.to_string()));
        }
        Ok(normalized)
    }
    fn infer(&self, raw: &Raw) -> Result<Value> {
        datatype::infer(raw, |id| self.class_of(id))
    }
    /// Infers the type a value would be stored with, resolving object references.
    pub fn value_type_of(&self, value: impl Into<Raw>) -> Result<ValueType> {
        Ok(self.infer(&value.into())?.value_type())
    }
    fn accepted_type(&self, object: ObjectId, property: &str) -> Result<Option<ValueType>> {
        let key = (object, property.to_string());
        if let Some(accepted) = self.accepted_types.lock()?.get(&key) {
            return Ok(Some(accepted.clone()));
        }
        let rows = self.persistor()?.select(
            &["ValueType"],
            PROPERTY_VALUE,
            &Predicate::object(object).and(Predicate::property(property)),
            true,
        )?;
        let accepted = rows
            .first()
            .map(|row| row.text(0))
            .transpose()?
            .map(|name| ValueType::from_name(&name));
        if let Some(accepted) = &accepted {
            self.accepted_types.lock()?.insert(key, accepted.clone());
        }
        Ok(accepted)
    }

    pub fn create(&self, class: &str, track_revisions: bool) -> Result<ObjectId> {
        let normalized = normalize_class(class);
        if ValueType::is_reserved(&normalized) || !CLASS_NAME.is_match(&normalized) {
            return Err(TesseraError::InvalidClass(class.to_string()));
        }
        let object = self.allocate_id()?;
        let created = self.clock.now();
        let inserted = self.persistor()?.insert(
            OBJECT,
            &[
                "Object_Identity",
                "Class",
                "Created",
                "Last_Cached",
                "Last_Revised",
                "Track_Revisions",
            ],
            &[vec![
                object_value(object),
                text_value(normalized.as_str()),
                created.into(),
                created.into(),
                created.into(),
                track_revisions.into(),
            ]],
        )?;
        if inserted != 1 {
            return Err(TesseraError::Invariant(format!(
                "creating object {object} inserted {inserted} rows"
            )));
        }
        info!(object, class = %normalized, track_revisions, "created object");
        Ok(object)
    }
    pub fn exists(&self, object: ObjectId, class: Option<&str>) -> Result<bool> {
        Ok(match (self.class_of(object)?, class) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(found), Some(class)) => found == normalize_class(class),
        })
    }

    pub fn add_property_value(
        &self,
        object: ObjectId,
        property: &str,
        value: impl Into<Raw>,
        index: bool,
    ) -> Result<bool> {
        let property = self.checked_property(property)?;
        let raw = value.into();
        self.require_class(object)?;
        let value = self.infer(&raw)?;
        self.add_inferred(object, &property, value, index)
    }
    /// Removes every value of the property before adding the new one.
    pub fn set_property_value(
        &self,
        object: ObjectId,
        property: &str,
        value: impl Into<Raw>,
        index: bool,
    ) -> Result<bool> {
        let property = self.checked_property(property)?;
        let raw = value.into();
        self.require_class(object)?;
        let value = self.infer(&raw)?;
        self.remove_values(object, &property, None)?;
        self.add_inferred(object, &property, value, index)
    }
    /// Removes the matching value, or every value of the property when none is given.
    pub fn remove_property_value(
        &self,
        object: ObjectId,
        property: &str,
        value: Option<Raw>,
    ) -> Result<bool> {
        let property = normalize_property(property);
        self.require_class(object)?;
        let target = value
            .map(|raw| datatype::infer_literal(&raw))
            .transpose()?;
        Ok(!self
            .remove_values(object, &property, target.as_ref())?
            .is_empty())
    }

    fn add_inferred(
        &self,
        object: ObjectId,
        property: &str,
        value: Value,
        index: bool,
    ) -> Result<bool> {
        let found = value.value_type();
        if let Some(expected) = self.accepted_type(object, property)? {
            if expected != found {
                return Err(TesseraError::TypeMismatch {
                    property: property.to_string(),
                    value: value.canonical(),
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
        let added = self.clock.now();
        let inserted = {
            let persistor = self.persistor()?;
            let inserted = persistor.insert_or_ignore(
                PROPERTY_VALUE,
                &[
                    "Object_Identity",
                    "Property",
                    "Value",
                    "ValueType",
                    "ValueHash",
                    "Added",
                ],
                &[vec![
                    object_value(object),
                    text_value(property),
                    value.to_stored(),
                    text_value(found.name()),
                    text_value(value.content_hash()),
                    added.into(),
                ]],
            )?;
            if inserted == 1 {
                persistor.update(
                    OBJECT,
                    &[("Last_Revised", added.into())],
                    &Predicate::object(object),
                )?;
            }
            inserted
        };
        if inserted == 0 {
            debug!(object, property, value = %value, "value already present");
            return Ok(false);
        }
        self.accepted_types
            .lock()?
            .insert((object, property.to_string()), found);
        trace!(object, property, value = %value, "added value");
        if self.should_track_revisions(object)? {
            self.track_revision(object, property, &value, RevisionKind::Addition);
        }
        if index {
            self.index_property(object, property)?;
        }
        Ok(true)
    }

    pub(crate) fn remove_values(
        &self,
        object: ObjectId,
        property: &str,
        target: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let mut predicate = Predicate::object(object).and(Predicate::property(property));
        if let Some(value) = target {
            predicate = predicate.and(Predicate::eq("ValueHash", text_value(value.content_hash())));
        }
        let removed = {
            let persistor = self.persistor()?;
            let rows = persistor.select(
                &["Value", "ValueType"],
                PROPERTY_VALUE,
                &predicate.clone().order_by("Added"),
                false,
            )?;
            let removed = rows
                .iter()
                .map(|row| Value::from_stored(row.value(0)?, &row.text(1)?))
                .collect::<Result<Vec<_>>>()?;
            if removed.is_empty() {
                return Ok(removed);
            }
            let deleted = persistor.delete(PROPERTY_VALUE, &predicate)?;
            if deleted != removed.len() {
                return Err(TesseraError::Invariant(format!(
                    "expected to remove {} values of {property} on {object}, removed {deleted}",
                    removed.len()
                )));
            }
            persistor.update(
                OBJECT,
                &[("Last_Revised", self.clock.now().into())],
                &Predicate::object(object),
            )?;
            removed
        };
        self.accepted_types
            .lock()?
            .remove(&(object, property.to_string()));
        debug!(object, property, count = removed.len(), "removed values");
        if self.should_track_revisions(object)? {
            for value in &removed {
                self.track_revision(object, property, value, RevisionKind::Removal);
            }
        }
        self.reindex_if_indexed(object, property)?;
        Ok(removed)
    }

    /// Deletes an object with all its values and index entries. The revision
    /// history is kept.
    pub fn delete(&self, object: ObjectId, require_class: Option<&str>) -> Result<bool> {
        let Some(class) = self.class_of(object)? else {
            return Ok(false);
        };
        if let Some(required) = require_class {
            let required = normalize_class(required);
            if required != class {
                return Err(TesseraError::WrongClass {
                    object,
                    class: required,
                });
            }
        }
        // rows, index entries and the identifier go together or not at all
        let deleted = self.atomically(|db| {
            let deleted = {
                let persistor = db.persistor()?;
                let deleted = persistor.delete(OBJECT, &Predicate::object(object))?;
                if deleted > 1 {
                    return Err(TesseraError::Invariant(format!(
                        "deleting object {object} removed {deleted} rows"
                    )));
                }
                if deleted == 1 {
                    persistor.delete(PROPERTY_VALUE, &Predicate::object(object))?;
                }
                deleted
            };
            if deleted == 1 {
                db.delete_indices_in_class(object, &class)?;
                db.release_id(object)?;
            }
            Ok(deleted)
        })?;
        if deleted == 0 {
            return Ok(false);
        }
        if let Err(e) = self.cache.remove(object) {
            warn!(object, error = %e, "could not purge cached snapshot");
        }
        self.accepted_types
            .lock()?
            .retain(|(kept, _), _| *kept != object);
        info!(object, class = %class, "deleted object");
        Ok(true)
    }

    pub fn load(&self, object: ObjectId, selection: &Selection, bypass_cache: bool) -> Result<Loaded> {
        let snapshot = self.snapshot(object, bypass_cache)?;
        Ok(match selection {
            Selection::All => Loaded::Object(snapshot),
            Selection::Only(names) if names.len() == 1 => {
                Loaded::Field(snapshot.get(&normalize_property(&names[0])).cloned())
            }
            Selection::Only(names) => {
                let names: Vec<String> = names.iter().map(|n| normalize_property(n)).collect();
                Loaded::Object(snapshot.restrict(&names))
            }
        })
    }
    pub(crate) fn snapshot(&self, object: ObjectId, bypass_cache: bool) -> Result<Snapshot> {
        let rows = self.persistor()?.select(
            &["Class", "Last_Cached", "Last_Revised"],
            OBJECT,
            &Predicate::object(object),
            true,
        )?;
        let row = rows.first().ok_or(TesseraError::NotFound(object))?;
        let class = row.text(0)?;
        let stale = row.integer(2)? > row.integer(1)?;
        if !bypass_cache && !stale {
            match self.cache.get(object) {
                Ok(Some(snapshot)) => {
                    trace!(object, "snapshot served from cache");
                    return Ok(snapshot);
                }
                Ok(None) => {}
                Err(e) => warn!(object, error = %e, "could not read cached snapshot"),
            }
        }
        let mut snapshot = Snapshot::new(&class);
        let rows = self.persistor()?.select(
            &["Property", "Value", "ValueType"],
            PROPERTY_VALUE,
            &Predicate::object(object).order_by("Added, rowid"),
            false,
        )?;
        for row in &rows {
            snapshot.push(row.text(0)?, Value::from_stored(row.value(1)?, &row.text(2)?)?);
        }
        if let Err(e) = self.cache.put(object, &snapshot) {
            warn!(object, error = %e, "could not cache snapshot");
        } else if let Err(e) = self.persistor().and_then(|persistor| {
            persistor.update(
                OBJECT,
                &[("Last_Cached", self.clock.now().into())],
                &Predicate::object(object),
            )
        }) {
            warn!(object, error = %e, "could not record cache time");
        }
        debug!(object, stale, bypass_cache, "rebuilt snapshot");
        Ok(snapshot)
    }

    pub fn enable_revision_tracking(&self, object: ObjectId) -> Result<bool> {
        self.set_revision_tracking(object, true)
    }
    pub fn disable_revision_tracking(&self, object: ObjectId) -> Result<bool> {
        self.set_revision_tracking(object, false)
    }
    fn set_revision_tracking(&self, object: ObjectId, track: bool) -> Result<bool> {
        let updated = self.persistor()?.update(
            OBJECT,
            &[("Track_Revisions", track.into())],
            &Predicate::object(object),
        )?;
        Ok(updated == 1)
    }
    pub fn should_track_revisions(&self, object: ObjectId) -> Result<bool> {
        let rows = self.persistor()?.select(
            &["Track_Revisions"],
            OBJECT,
            &Predicate::object(object),
            true,
        )?;
        Ok(rows.first().map(|row| row.integer(0)).transpose()?.unwrap_or(0) != 0)
    }

    fn timestamp(&self, object: ObjectId, column: &str) -> Result<Timestamp> {
        let rows = self
            .persistor()?
            .select(&[column], OBJECT, &Predicate::object(object), true)?;
        rows.first()
            .ok_or(TesseraError::NotFound(object))?
            .integer(0)
    }
    pub fn time_of_creation(&self, object: ObjectId) -> Result<Timestamp> {
        self.timestamp(object, "Created")
    }
    pub fn time_of_last_cache(&self, object: ObjectId) -> Result<Timestamp> {
        self.timestamp(object, "Last_Cached")
    }
    pub fn time_of_last_revision(&self, object: ObjectId) -> Result<Timestamp> {
        self.timestamp(object, "Last_Revised")
    }

    fn objects_where(&self, predicate: Predicate) -> Result<Vec<ObjectId>> {
        self.persistor()?
            .select(
                &["Object_Identity"],
                OBJECT,
                &predicate.order_by("Created, Object_Identity"),
                false,
            )?
            .iter()
            .map(|row| row.object(0))
            .collect()
    }
    /// Every object, oldest first.
    pub fn get_all_objects(&self) -> Result<Vec<ObjectId>> {
        self.objects_where(Predicate::all())
    }
    pub fn get_all_objects_of_class(&self, class: &str) -> Result<Vec<ObjectId>> {
        self.objects_where(Predicate::eq("Class", text_value(normalize_class(class))))
    }
    pub fn get_all_classes(&self) -> Result<Vec<String>> {
        self.persistor()?
            .query("select distinct Class from Object order by Class", &[])?
            .iter()
            .map(|row| row.text(0))
            .collect()
    }
    pub fn delete_all_objects_of_class(&self, class: &str) -> Result<usize> {
        let mut deleted = 0;
        for object in self.get_all_objects_of_class(class)? {
            if self.delete(object, Some(class))? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
    /// Deletes every object in the store.
    pub fn reset(&self) -> Result<usize> {
        let mut deleted = 0;
        for object in self.get_all_objects()? {
            if self.delete(object, None)? {
                deleted += 1;
            }
        }
        info!(deleted, "store reset");
        Ok(deleted)
    }
    pub fn load_all_objects_of_class(
        &self,
        class: &str,
        selection: &Selection,
        bypass_cache: bool,
    ) -> Result<Vec<(ObjectId, Loaded)>> {
        self.get_all_objects_of_class(class)?
            .into_iter()
            .map(|object| Ok((object, self.load(object, selection, bypass_cache)?)))
            .collect()
    }

    /// Copies the properties of one object onto another object of the same class.
    /// Returns false without touching anything when the classes differ.
    pub fn copy(
        &self,
        source: ObjectId,
        target: ObjectId,
        delete_source: bool,
        mode: CopyMode,
    ) -> Result<bool> {
        let source_class = self.require_class(source)?;
        let target_class = self.require_class(target)?;
        if source_class != target_class {
            debug!(source, target, "objects of different classes are not copied");
            return Ok(false);
        }
        let snapshot = self.snapshot(source, true)?;
        let copied: Vec<&String> = snapshot
            .properties()
            .map(|(property, _)| property)
            .filter(|property| property.as_str() != CLASS)
            .collect();
        let mut indexed = Vec::new();
        for property in &copied {
            if self.is_indexed(target, property)? {
                indexed.push(property.as_str());
            }
        }
        self.transaction(|db| {
            for property in &copied {
                if mode == CopyMode::Overwrite {
                    db.remove_values(target, property, None)?;
                }
                if let Some(field) = snapshot.get(property) {
                    for value in field.values() {
                        db.add_inferred(target, property, value.clone(), false)?;
                    }
                }
            }
            if delete_source {
                db.delete(source, None)?;
            }
            Ok(())
        })?;
        for property in indexed {
            self.index_property(target, property)?;
        }
        info!(source, target, ?mode, delete_source, "copied object");
        Ok(true)
    }

    // ------------- Transactions -------------
    /// Runs `work` in a transaction that commits on `Ok` and rolls back on `Err`.
    pub fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T>,
    {
        if !self.begin_transaction()? {
            return Err(TesseraError::Invariant(
                "a transaction is already open".to_string(),
            ));
        }
        self.settle(work(self))
    }
    /// Like `transaction`, but joins a transaction that is already open.
    fn atomically<T>(&self, work: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        if self.begin_transaction()? {
            self.settle(work(self))
        } else {
            work(self)
        }
    }
    fn settle<T>(&self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(result) => {
                self.commit_transaction()?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_error) = self.rollback_transaction() {
                    warn!(error = %rollback_error, "rollback failed");
                }
                Err(e)
            }
        }
    }
    pub fn begin_transaction(&self) -> Result<bool> {
        self.persistor()?.begin_transaction()
    }
    pub fn commit_transaction(&self) -> Result<bool> {
        self.persistor()?.commit()
    }
    /// Also forgets cached state, since it may describe rows the rollback undid.
    pub fn rollback_transaction(&self) -> Result<bool> {
        let rolled_back = self.persistor()?.rollback()?;
        if rolled_back {
            if let Err(e) = self.cache.clear() {
                warn!(error = %e, "could not clear snapshot cache after rollback");
            }
            self.accepted_types.lock()?.clear();
            debug!("transaction rolled back");
        }
        Ok(rolled_back)
    }

    pub fn close(self) -> Result<()> {
        let Database {
            persistor, cache, ..
        } = self;
        drop(cache);
        match Arc::try_unwrap(persistor) {
            Ok(persistor) => persistor.into_inner()?.close(),
            Err(_) => Err(TesseraError::Invariant(
                "the backing store is still in use".to_string(),
            )),
        }
    }
}
