use tessera::config::{CacheKind, IdentifierSettings};
use tessera::construct::{Database, Field, Loaded, ObjectId, Selection};
use tessera::datatype::Value;
use tessera::persist::PersistenceMode;

fn with_cache(kind: CacheKind) -> Database {
    Database::open(&PersistenceMode::InMemory, kind, &IdentifierSettings::default()).expect("db")
}

fn ages(db: &Database, object: ObjectId) -> Option<Field> {
    match db.load(object, &Selection::only(&["age"]), false).unwrap() {
        Loaded::Field(field) => field,
        other => panic!("expected a field, got {other:?}"),
    }
}

fn staleness_is_detected(db: &Database) {
    let ann = db.create("person", false).unwrap();
    db.add_property_value(ann, "age", 30, false).unwrap();
    assert_eq!(ages(db, ann), Some(Field::One(Value::Integer(30))));
    assert!(db.time_of_last_cache(ann).unwrap() > db.time_of_last_revision(ann).unwrap());

    db.add_property_value(ann, "age", 31, false).unwrap();
    assert!(db.time_of_last_revision(ann).unwrap() > db.time_of_last_cache(ann).unwrap());
    assert_eq!(
        ages(db, ann),
        Some(Field::Many(vec![Value::Integer(30), Value::Integer(31)]))
    );

    db.remove_property_value(ann, "age", Some(30.into())).unwrap();
    assert_eq!(ages(db, ann), Some(Field::One(Value::Integer(31))));
}

#[test]
fn memory_cache_follows_revisions() {
    staleness_is_detected(&with_cache(CacheKind::Memory));
}

#[test]
fn table_cache_follows_revisions() {
    staleness_is_detected(&with_cache(CacheKind::Table));
}

#[test]
fn disabled_cache_still_loads() {
    staleness_is_detected(&with_cache(CacheKind::None));
}

#[test]
fn repeated_loads_agree() {
    let db = with_cache(CacheKind::Table);
    let ann = db.create("person", false).unwrap();
    db.add_property_value(ann, "name", "Ann", false).unwrap();
    db.add_property_value(ann, "born", "1990-05-01", false).unwrap();
    db.add_property_value(ann, "score", 2.5, false).unwrap();
    let rebuilt = db.load(ann, &Selection::All, true).unwrap();
    let cached = db.load(ann, &Selection::All, false).unwrap();
    assert_eq!(rebuilt, cached);
    assert_eq!(cached.snapshot().and_then(|s| s.class()), Some("PERSON"));
}

#[test]
fn rollback_forgets_cached_state() {
    let db = with_cache(CacheKind::Memory);
    let ann = db.create("person", false).unwrap();
    db.add_property_value(ann, "age", 30, false).unwrap();
    ages(&db, ann);

    assert!(db.begin_transaction().unwrap());
    db.add_property_value(ann, "age", 99, false).unwrap();
    assert_eq!(ages(&db, ann).map(|field| field.len()), Some(2));
    assert!(db.rollback_transaction().unwrap());

    assert_eq!(ages(&db, ann), Some(Field::One(Value::Integer(30))));
    // the accepted type is forgotten too, so a rolled back first value does not pin anything
    let bob = db.create("person", false).unwrap();
    db.begin_transaction().unwrap();
    db.add_property_value(bob, "height", "unknown", false).unwrap();
    db.rollback_transaction().unwrap();
    assert!(db.add_property_value(bob, "height", 180, false).unwrap());
}
