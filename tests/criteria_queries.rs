use tessera::TesseraError;
use tessera::construct::{Database, ObjectId, Selection};
use tessera::persist::PersistenceMode;

struct People {
    db: Database,
    a: ObjectId,
    b: ObjectId,
    c: ObjectId,
}

fn people() -> People {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let a = db.create("person", false).unwrap();
    let b = db.create("person", false).unwrap();
    let c = db.create("person", false).unwrap();
    for (object, age) in [(a, 10), (b, 20), (c, 30)] {
        db.add_property_value(object, "age", age, false).unwrap();
    }
    db.add_property_value(a, "name", "John", false).unwrap();
    db.add_property_value(b, "name", "Joanna", false).unwrap();
    db.add_property_value(c, "name", "Mary", false).unwrap();
    db.add_property_value(a, "city", "New York", false).unwrap();
    db.add_property_value(b, "city", "Boston", false).unwrap();
    // same property on another class must never leak into person queries
    let town = db.create("city", false).unwrap();
    db.add_property_value(town, "age", 20, false).unwrap();
    People { db, a, b, c }
}

fn sorted(mut objects: Vec<ObjectId>) -> Vec<ObjectId> {
    objects.sort_unstable();
    objects
}

fn meeting(people: &People, criteria: &str) -> Vec<ObjectId> {
    people
        .db
        .objects_of_class_that_meet_criteria("person", criteria)
        .unwrap_or_else(|e| panic!("{criteria}: {e}"))
}

#[test]
fn and_narrows_the_result() {
    let p = people();
    assert_eq!(meeting(&p, "age > 10 AND age < 30"), vec![p.b]);
}

#[test]
fn or_widens_the_result() {
    let p = people();
    assert_eq!(meeting(&p, "age = 10 OR age = 30"), sorted(vec![p.a, p.c]));
}

#[test]
fn range_bounds_are_inclusive() {
    let p = people();
    assert_eq!(meeting(&p, "age RANGE 10 30"), sorted(vec![p.a, p.b, p.c]));
    assert_eq!(meeting(&p, "age range 11 29"), vec![p.b]);
}

#[test]
fn results_are_restricted_to_the_class() {
    let p = people();
    assert_eq!(meeting(&p, "age = 20"), vec![p.b]);
    assert!(
        p.db.objects_of_class_that_meet_criteria("nobody", "age = 20")
            .unwrap()
            .is_empty()
    );
}

#[test]
fn and_binds_tighter_than_or() {
    let p = people();
    assert_eq!(meeting(&p, "age = 10 OR age = 20 AND age = 30"), vec![p.a]);
    assert!(meeting(&p, "(age = 10 OR age = 20) AND age = 30").is_empty());
    assert_eq!(
        meeting(&p, "(age = 10 OR age = 20) and name like 'Jo%'"),
        sorted(vec![p.a, p.b])
    );
}

#[test]
fn comparison_operators() {
    let p = people();
    assert_eq!(meeting(&p, "age != 10"), sorted(vec![p.b, p.c]));
    assert_eq!(meeting(&p, "age>=20"), sorted(vec![p.b, p.c]));
    assert_eq!(meeting(&p, "age<=20"), sorted(vec![p.a, p.b]));
    assert_eq!(meeting(&p, "name LIKE 'jo%'"), sorted(vec![p.a, p.b]));
    assert_eq!(meeting(&p, "city = 'New York'"), vec![p.a]);
    assert_eq!(meeting(&p, "city = \"Boston\" OR name = Mary"), sorted(vec![p.b, p.c]));
}

#[test]
fn clauses_on_multi_valued_properties() {
    let p = people();
    p.db.add_property_value(p.a, "tag", "red", false).unwrap();
    p.db.add_property_value(p.a, "tag", "blue", false).unwrap();
    p.db.add_property_value(p.b, "tag", "red", false).unwrap();
    assert_eq!(meeting(&p, "tag = red AND tag = blue"), vec![p.a]);
    // some value differs
    assert_eq!(meeting(&p, "tag != red"), vec![p.a]);
}

#[test]
fn ordering_is_typed() {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let early = db.create("event", false).unwrap();
    let late = db.create("event", false).unwrap();
    db.add_property_value(early, "at", "1990-05-01", false).unwrap();
    db.add_property_value(late, "at", "2001-01-01 12:00:00", false).unwrap();
    db.add_property_value(early, "score", 2.5, false).unwrap();
    db.add_property_value(late, "score", 3, false).unwrap();
    db.add_property_value(early, "label", "abc", false).unwrap();
    db.add_property_value(late, "label", "abd", false).unwrap();

    let find = |criteria: &str| db.objects_of_class_that_meet_criteria("event", criteria).unwrap();
    assert_eq!(find("at < 2000-01-01"), vec![early]);
    assert_eq!(find("at > '2000-06-30 08:00'"), vec![late]);
    assert_eq!(find("score > 2.6"), vec![late]);
    assert_eq!(find("score < 3"), vec![early]);
    assert_eq!(find("score range 2 2.5"), vec![early]);
    assert_eq!(find("label > abc"), vec![late]);
    // a numeric literal never matches string values
    assert!(find("label > 1").is_empty());
}

#[test]
fn matching_objects_can_be_loaded() {
    let p = people();
    let loaded = p
        .db
        .load_objects_of_class_that_meet_criteria("person", "age > 15", &Selection::only(&["name"]), false)
        .unwrap();
    let names: Vec<String> = loaded
        .iter()
        .map(|(_, loaded)| {
            loaded
                .field()
                .and_then(|field| field.one())
                .map(|value| value.to_string())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(loaded.len(), 2);
    assert!(names.contains(&"Joanna".to_string()));
    assert!(names.contains(&"Mary".to_string()));
}

#[test]
fn syntax_errors_name_the_criteria() {
    let p = people();
    for bad in ["age >", "(age = 1", "age = 1 OR", "age ~ 3", "age range 1 z2000-01-01"] {
        match p.db.objects_of_class_that_meet_criteria("person", bad) {
            Err(TesseraError::Syntax { criteria, .. }) => assert_eq!(criteria, bad),
            other => panic!("{bad:?} gave {other:?}"),
        }
    }
}

#[test]
fn integer_equality_ignores_large_whole_floats() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let exact = db.create("star", false).unwrap();
    let approximate = db.create("star", false).unwrap();
    db.add_property_value(exact, "mass", 1_000_000_000_000_000_i64, false)
        .unwrap();
    db.add_property_value(approximate, "mass", 1e15, false).unwrap();
    assert_eq!(
        db.objects_of_class_that_meet_criteria("star", "mass = 1000000000000000")
            .unwrap(),
        vec![exact]
    );
    let mut both = vec![exact, approximate];
    both.sort_unstable();
    assert_eq!(
        db.objects_of_class_that_meet_criteria("star", "mass RANGE 999999999999999 1000000000000001")
            .unwrap(),
        both
    );
}
