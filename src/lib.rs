//! Tessera – an entity-attribute-value store on top of SQLite.
//!
//! Tessera lets callers create schema-less *objects* and attach typed,
//! possibly multi-valued properties to them:
//! * An object is an opaque identity ([`construct::ObjectId`], a `u64`) with an
//!   immutable class, such as `PERSON`.
//! * A property value pairs a property name with a [`datatype::Value`]. The
//!   value type is inferred on the way in, and the first value stored for an
//!   (object, property) pair pins its type until all its values are removed.
//! * A value that is the id of an existing object becomes a reference to it,
//!   typed by that object's class.
//!
//! ## Modules
//! * [`construct`] – The [`construct::Database`] with the object/property model,
//!   identity allocation and transactions.
//! * [`datatype`] – Values, value types and type inference.
//! * [`persist`] – The SQLite backing store adapter.
//! * [`cache`] – Snapshot caches, invalidated by comparing revision and cache times.
//! * [`criteria`] – Compiler and evaluator for boolean criteria such as
//!   `age > 10 AND (city = 'Oslo' OR city = 'Bergen')`.
//! * [`index`] – Per-class substring indexes and search.
//! * [`revision`] – The revision log kept for tracked objects.
//! * [`interface`] – Background criteria queries with cancellation.
//! * [`config`] – Layered configuration.
//!
//! ## Quick Start
//! ```
//! use tessera::construct::{Database, Loaded, Selection};
//! use tessera::persist::PersistenceMode;
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let alice = db.create("person", false).unwrap();
//! db.add_property_value(alice, "age", 31, false).unwrap();
//! db.add_property_value(alice, "nickname", "Al", false).unwrap();
//! db.add_property_value(alice, "nickname", "Ally", false).unwrap();
//! let found = db.objects_of_class_that_meet_criteria("person", "age >= 30").unwrap();
//! assert_eq!(found, vec![alice]);
//! match db.load(alice, &Selection::only(&["nickname"]), false).unwrap() {
//!     Loaded::Field(Some(field)) => assert_eq!(field.len(), 2),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

pub mod cache;
pub mod config;
pub mod construct;
pub mod criteria;
pub mod datatype;
pub mod error;
pub mod index;
pub mod interface;
pub mod persist;
pub mod revision;

pub use error::{Result, TesseraError};
