//! Substring search indexes.
//!
//! Every class gets its own `<CLASS>_Index` table holding one row per
//! (substring hash, object, property). A value is indexed by hashing each of
//! its contiguous substrings, so a search token matches wherever it occurs
//! inside an indexed value.

use std::collections::HashSet;

use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::construct::{
    CLASS, Database, Field, Loaded, ObjectId, OtherHasher, Selection, normalize_class,
    normalize_property,
};
use crate::datatype::content_hash;
use crate::error::{Result, TesseraError};
use crate::persist::{Persistor, Predicate, object_value, text_value};

pub type HashSetOfHashes = HashSet<String, OtherHasher>;

fn index_name(class: &str) -> String {
    let sanitized: String = normalize_class(class)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    format!("{sanitized}_Index")
}

/// The quoted index table of a class. Only `[A-Z0-9_]` survives sanitizing,
/// and quoting keeps digit-leading class names valid identifiers.
pub fn index_table(class: &str) -> String {
    format!("\"{}\"", index_name(class))
}

/// Hashes of every contiguous substring of the lowercased text.
pub fn substring_hashes(text: &str) -> HashSetOfHashes {
    let characters: Vec<char> = text.to_lowercase().chars().collect();
    let mut hashes = HashSetOfHashes::default();
    for start in 0..characters.len() {
        let mut substring = String::new();
        for character in &characters[start..] {
            substring.push(*character);
            hashes.insert(content_hash(&substring));
        }
    }
    hashes
}

fn field_hashes(field: Option<&Field>) -> HashSetOfHashes {
    let mut hashes = HashSetOfHashes::default();
    if let Some(field) = field {
        for value in field.values() {
            hashes.extend(substring_hashes(&value.canonical()));
        }
    }
    hashes
}

fn create_index_table(persistor: &Persistor, class: &str) -> Result<()> {
    let name = index_name(class);
    persistor.exec(&format!(
        "create table if not exists \"{name}\" (
            Hash text not null,
            Object_Identity integer not null,
            Property text not null,
            constraint \"unique_{name}\" primary key (
                Object_Identity,
                Hash,
                Property
            )
        )"
    ))?;
    persistor.exec(&format!(
        "create index if not exists \"{name}_by_Hash\" on \"{name}\" (Hash)"
    ))?;
    persistor.exec(&format!(
        "create index if not exists \"{name}_by_Property\" on \"{name}\" (Property)"
    ))?;
    Ok(())
}

/// Treats a class that was never indexed as one with no entries.
fn tolerate_missing<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_missing_table() => Ok(T::default()),
        other => other,
    }
}

fn indexed_hashes(
    persistor: &Persistor,
    table: &str,
    object: ObjectId,
    property: &str,
) -> Result<HashSetOfHashes> {
    persistor
        .select(
            &["Hash"],
            table,
            &Predicate::object(object).and(Predicate::property(property)),
            false,
        )?
        .iter()
        .map(|row| row.text(0))
        .collect()
}

impl Database {
    /// Brings the index entries of one property in line with its values:
    /// fresh hashes are inserted first, then stale ones are deleted.
    fn index_field(
        &self,
        object: ObjectId,
        class: &str,
        property: &str,
        field: Option<&Field>,
    ) -> Result<HashSetOfHashes> {
        let table = index_table(class);
        let generated = field_hashes(field);
        let persistor = self.persistor()?;
        create_index_table(&persistor, class)?;
        let began = persistor.begin_transaction()?;
        let result = (|| -> Result<()> {
            let existing = indexed_hashes(&persistor, &table, object, property)?;
            let fresh: Vec<_> = generated
                .difference(&existing)
                .map(|hash| {
                    vec![
                        text_value(hash.as_str()),
                        object_value(object),
                        text_value(property),
                    ]
                })
                .collect();
            persistor.insert_or_ignore(&table, &["Hash", "Object_Identity", "Property"], &fresh)?;
            let mut stale = 0;
            for hash in existing.difference(&generated) {
                stale += persistor.delete(
                    &table,
                    &Predicate::object(object)
                        .and(Predicate::property(property))
                        .and(Predicate::eq("Hash", text_value(hash.as_str()))),
                )?;
            }
            debug!(object, property, fresh = fresh.len(), stale, "indexed property");
            Ok(())
        })();
        match result {
            Ok(()) => {
                if began {
                    persistor.commit()?;
                }
                Ok(generated)
            }
            Err(e) => {
                if began {
                    if let Err(rollback_error) = persistor.rollback() {
                        warn!(error = %rollback_error, "could not roll back indexing");
                    }
                }
                Err(e)
            }
        }
    }

    /// Indexes the selected properties of an object and returns every hash generated.
    pub fn index(&self, object: ObjectId, selection: &Selection) -> Result<HashSetOfHashes> {
        let snapshot = self.snapshot(object, false)?;
        let class = snapshot
            .class()
            .map(str::to_string)
            .ok_or(TesseraError::NotFound(object))?;
        let properties: Vec<String> = match selection {
            Selection::All => snapshot
                .properties()
                .map(|(property, _)| property.clone())
                .filter(|property| property != CLASS)
                .collect(),
            Selection::Only(names) => names.iter().map(|name| normalize_property(name)).collect(),
        };
        let mut generated = HashSetOfHashes::default();
        for property in properties {
            generated.extend(self.index_field(object, &class, &property, snapshot.get(&property))?);
        }
        Ok(generated)
    }

    pub fn index_property(&self, object: ObjectId, property: &str) -> Result<HashSetOfHashes> {
        let property = normalize_property(property);
        let class = self.require_class(object)?;
        let field = match self.load(object, &Selection::Only(vec![property.clone()]), false)? {
            Loaded::Field(field) => field,
            Loaded::Object(_) => None,
        };
        self.index_field(object, &class, &property, field.as_ref())
    }

    pub fn index_all_objects_of_class(&self, class: &str, selection: &Selection) -> Result<usize> {
        let objects = self.get_all_objects_of_class(class)?;
        for object in &objects {
            self.index(*object, selection)?;
        }
        debug!(class, count = objects.len(), "indexed class");
        Ok(objects.len())
    }

    /// Removes every index entry of an object.
    pub fn delete_indices(&self, object: ObjectId) -> Result<usize> {
        let class = self.require_class(object)?;
        self.delete_indices_in_class(object, &class)
    }
    pub(crate) fn delete_indices_in_class(&self, object: ObjectId, class: &str) -> Result<usize> {
        tolerate_missing(
            self.persistor()?
                .delete(&index_table(class), &Predicate::object(object)),
        )
    }

    pub fn is_indexed(&self, object: ObjectId, property: &str) -> Result<bool> {
        let class = self.require_class(object)?;
        let persistor = self.persistor()?;
        let indexed = tolerate_missing(indexed_hashes(
            &persistor,
            &index_table(&class),
            object,
            &normalize_property(property),
        ))?;
        Ok(!indexed.is_empty())
    }

    /// Re-indexes a property only when it already has index entries, so values
    /// that were never indexed stay unindexed.
    pub(crate) fn reindex_if_indexed(&self, object: ObjectId, property: &str) -> Result<()> {
        if self.is_indexed(object, property)? {
            self.index_property(object, property)?;
        }
        Ok(())
    }

    /// Objects of the class whose indexed values contain every whitespace
    /// separated token of the query.
    pub fn search_ids(&self, query: &str, class: &str) -> Result<Vec<ObjectId>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let table = index_table(class);
        let sql = format!("select distinct Object_Identity from {table} where Hash = ?");
        let mut found: Option<RoaringTreemap> = None;
        for token in &tokens {
            let rows = tolerate_missing(
                self.persistor()?
                    .query(&sql, &[text_value(content_hash(token))]),
            )?;
            let matching = rows
                .iter()
                .map(|row| row.object(0))
                .collect::<Result<RoaringTreemap>>()?;
            let narrowed = match found {
                Some(mut so_far) => {
                    so_far &= matching;
                    so_far
                }
                None => matching,
            };
            if narrowed.is_empty() {
                return Ok(Vec::new());
            }
            found = Some(narrowed);
        }
        Ok(found.map(|ids| ids.iter().collect()).unwrap_or_default())
    }

    pub fn search(
        &self,
        query: &str,
        class: &str,
        selection: &Selection,
    ) -> Result<Vec<(ObjectId, Loaded)>> {
        self.search_ids(query, class)?
            .into_iter()
            .map(|object| Ok((object, self.load(object, selection, false)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Value;
    use crate::persist::{IDENTIFIER, PersistenceMode};

    #[test]
    fn every_substring_is_hashed() {
        let hashes = substring_hashes("Abc");
        // a, b, c, ab, bc, abc
        assert_eq!(hashes.len(), 6);
        assert!(hashes.contains(&content_hash("bc")));
        assert!(!hashes.contains(&content_hash("Abc")));
    }

    #[test]
    fn repeated_substrings_collapse() {
        assert_eq!(substring_hashes("aaa").len(), 3);
        assert!(substring_hashes("").is_empty());
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(index_table("person"), "\"PERSON_Index\"");
        assert_eq!(index_table("big-cat;drop"), "\"BIG_CATDROP_Index\"");
        assert_eq!(index_table("3d model"), "\"3D_MODEL_Index\"");
    }

    fn stored_hashes(db: &Database, object: ObjectId, property: &str) -> HashSetOfHashes {
        let persistor = db.persistor().unwrap();
        indexed_hashes(&persistor, &index_table("person"), object, property).unwrap()
    }

    #[test]
    fn reindexing_leaves_the_table_unchanged() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let ann = db.create("person", false).unwrap();
        db.add_property_value(ann, "name", "Annika", false).unwrap();
        db.index_property(ann, "name").unwrap();
        let first = stored_hashes(&db, ann, "name");
        db.index_property(ann, "name").unwrap();
        let second = stored_hashes(&db, ann, "name");
        assert_eq!(first, second);
        assert_eq!(first.len(), substring_hashes("Annika").len());

        // stale entries go away when the value changes
        db.set_property_value(ann, "name", "Bo", true).unwrap();
        assert_eq!(stored_hashes(&db, ann, "name"), substring_hashes("Bo"));
    }

    // A view under the index table's name makes every index write fail
    // with something other than a missing table.
    fn block_index_writes(db: &Database) {
        db.persistor()
            .unwrap()
            .exec(
                "create view \"PERSON_Index\" as
                 select 'h' as Hash, 0 as Object_Identity, 'p' as Property",
            )
            .unwrap();
    }

    #[test]
    fn failed_indexing_still_records_the_addition() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let ann = db.create("person", true).unwrap();
        block_index_writes(&db);
        assert!(db.add_property_value(ann, "name", "Ann", true).is_err());
        let history = db.load_revision_history(ann, None, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_string(), "+name Ann");
    }

    #[test]
    fn failed_delete_leaves_the_object_whole() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let ann = db.create("person", false).unwrap();
        db.add_property_value(ann, "name", "Ann", false).unwrap();
        block_index_writes(&db);
        assert!(db.delete(ann, None).is_err());
        assert!(db.exists(ann, Some("person")).unwrap());
        assert_eq!(
            db.load(ann, &Selection::only(&["name"]), true).unwrap(),
            Loaded::Field(Some(Field::One(Value::Str("Ann".into()))))
        );
        let identifiers = db
            .persistor()
            .unwrap()
            .select(
                &["Identifier"],
                IDENTIFIER,
                &Predicate::eq("Identifier", object_value(ann)),
                false,
            )
            .unwrap();
        assert_eq!(identifiers.len(), 1);
    }
}
