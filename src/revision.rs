//! The append-only revision log of tracked objects.

use std::fmt;

use tracing::{debug, warn};

use crate::construct::{Database, ObjectId};
use crate::datatype::{Timestamp, Value};
use crate::error::{Result, TesseraError};
use crate::persist::{Predicate, REVISION, object_value, text_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    Addition,
    Removal,
}
impl RevisionKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            RevisionKind::Addition => "+",
            RevisionKind::Removal => "-",
        }
    }
    pub fn from_symbol(symbol: &str) -> Option<RevisionKind> {
        match symbol {
            "+" => Some(RevisionKind::Addition),
            "-" => Some(RevisionKind::Removal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub object: ObjectId,
    pub property: String,
    pub value: Value,
    pub kind: RevisionKind,
    pub time: Timestamp,
}
impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{} {}", self.kind.symbol(), self.property, self.value)
    }
}

fn time_range(object: ObjectId, start: Option<Timestamp>, end: Option<Timestamp>) -> Predicate {
    let mut predicate = Predicate::object(object);
    if let Some(start) = start {
        predicate = predicate.and(Predicate::new("RevisionTime >= ?", vec![start.into()]));
    }
    if let Some(end) = end {
        predicate = predicate.and(Predicate::new("RevisionTime < ?", vec![end.into()]));
    }
    predicate
}

impl Database {
    /// Appends to the log. A failure is logged and reported as false, it never
    /// undoes the mutation being recorded.
    pub(crate) fn track_revision(
        &self,
        object: ObjectId,
        property: &str,
        value: &Value,
        kind: RevisionKind,
    ) -> bool {
        let time = self.clock.now();
        let recorded = self.persistor().and_then(|persistor| {
            persistor.insert(
                REVISION,
                &[
                    "Object_Identity",
                    "Property",
                    "RevisionType",
                    "Value",
                    "ValueType",
                    "RevisionTime",
                ],
                &[vec![
                    object_value(object),
                    text_value(property),
                    text_value(kind.symbol()),
                    value.to_stored(),
                    text_value(value.value_type().name()),
                    time.into(),
                ]],
            )
        });
        match recorded {
            Ok(_) => true,
            Err(e) => {
                warn!(object, property, error = %e, "could not record revision");
                false
            }
        }
    }

    /// Revisions within `[start, end)`, most recent first. Open bounds are unbounded.
    pub fn load_revision_history(
        &self,
        object: ObjectId,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<Revision>> {
        let rows = self.persistor()?.select(
            &["Property", "RevisionType", "Value", "ValueType", "RevisionTime"],
            REVISION,
            &time_range(object, start, end).order_by("RevisionTime desc, Revision_Identity desc"),
            false,
        )?;
        rows.iter()
            .map(|row| {
                let symbol = row.text(1)?;
                let kind = RevisionKind::from_symbol(&symbol).ok_or_else(|| {
                    TesseraError::DataCorruption {
                        message: format!("unknown revision type {symbol}"),
                    }
                })?;
                Ok(Revision {
                    object,
                    property: row.text(0)?,
                    value: Value::from_stored(row.value(2)?, &row.text(3)?)?,
                    kind,
                    time: row.integer(4)?,
                })
            })
            .collect()
    }

    /// Purges revisions within `[start, end)`, returns whether any were removed.
    pub fn remove_revision_history(
        &self,
        object: ObjectId,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<bool> {
        let removed = self
            .persistor()?
            .delete(REVISION, &time_range(object, start, end))?;
        debug!(object, removed, "removed revision history");
        Ok(removed > 0)
    }
}
