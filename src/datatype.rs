// used for persistence
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};

// used for timestamps and DATETIME values
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
// so regular expressions are only compiled once
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

// used to print out readable forms of a data type
use std::fmt;
use std::sync::Mutex;

use crate::construct::ObjectId;
use crate::error::{Result, TesseraError};

pub const INTEGER: &str = "INTEGER";
pub const FLOAT: &str = "FLOAT";
pub const STRING: &str = "STRING";
pub const DATETIME: &str = "DATETIME";
pub const BOOLEAN: &str = "BOOLEAN";

const CANONICAL_DATETIME: &str = "%Y-%m-%d %H:%M:%S%.f";

lazy_static! {
    static ref INTEGER_TEXT: Regex = Regex::new(r"^[+-]?[0-9]+$").unwrap();
    static ref FLOAT_TEXT: Regex =
        Regex::new(r"^[+-]?(?:[0-9]+\.[0-9]*|\.[0-9]+|[0-9]+)(?:[eE][+-]?[0-9]+)?$").unwrap();
}

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Hands out strictly increasing timestamps, even when the wall clock stalls
/// or steps backwards.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Timestamp>,
}
impl Clock {
    pub fn starting_after(timestamp: Timestamp) -> Self {
        Self {
            last: Mutex::new(timestamp),
        }
    }
    pub fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = wall.max(*last + 1);
        *last
    }
}

/// Hex encoded content hash, used for value identity and for index entries.
pub fn content_hash(text: &str) -> String {
    let mut hex = blake3::hash(text.as_bytes()).to_hex().to_string();
    hex.truncate(32);
    hex
}

// ------------- Value types --------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Integer,
    Float,
    String,
    DateTime,
    Boolean,
    /// A reference to an object of the named class.
    Object(String),
}

/// Groups of value types that can be ordered against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Numeric,
    Temporal,
    Truth,
    Text,
    Reference,
}

impl ValueType {
    pub const RESERVED: [&'static str; 5] = [INTEGER, FLOAT, STRING, DATETIME, BOOLEAN];

    pub fn name(&self) -> &str {
        match self {
            ValueType::Integer => INTEGER,
            ValueType::Float => FLOAT,
            ValueType::String => STRING,
            ValueType::DateTime => DATETIME,
            ValueType::Boolean => BOOLEAN,
            ValueType::Object(class) => class,
        }
    }
    /// Anything that is not a reserved type name is taken as a class name.
    pub fn from_name(name: &str) -> ValueType {
        match name {
            INTEGER => ValueType::Integer,
            FLOAT => ValueType::Float,
            STRING => ValueType::String,
            DATETIME => ValueType::DateTime,
            BOOLEAN => ValueType::Boolean,
            class => ValueType::Object(class.to_string()),
        }
    }
    pub fn is_reserved(name: &str) -> bool {
        Self::RESERVED
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
    }
    pub fn family(&self) -> Family {
        match self {
            ValueType::Integer | ValueType::Float => Family::Numeric,
            ValueType::DateTime => Family::Temporal,
            ValueType::Boolean => Family::Truth,
            ValueType::String => Family::Text,
            ValueType::Object(_) => Family::Reference,
        }
    }
}
impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Family {
    /// The stored type names belonging to this family.
    pub fn type_names(&self) -> &'static [&'static str] {
        match self {
            Family::Numeric => &[INTEGER, FLOAT],
            Family::Temporal => &[DATETIME],
            Family::Truth => &[BOOLEAN],
            Family::Text => &[STRING],
            Family::Reference => &[],
        }
    }
}

// ------------- Values --------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    DateTime(NaiveDateTime),
    ObjectRef { id: ObjectId, class: String },
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::String,
            Value::Boolean(_) => ValueType::Boolean,
            Value::DateTime(_) => ValueType::DateTime,
            Value::ObjectRef { class, .. } => ValueType::Object(class.clone()),
        }
    }
    /// The text form that content hashes and substring indexes are computed on.
    pub fn canonical(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => canonical_float(*f),
            Value::Str(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::DateTime(t) => t.format(CANONICAL_DATETIME).to_string(),
            Value::ObjectRef { id, .. } => id.to_string(),
        }
    }
    pub fn content_hash(&self) -> String {
        content_hash(&self.canonical())
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectRef { id, .. } => Some(*id),
            _ => None,
        }
    }
    /// Numbers and references are stored natively, everything else as canonical text.
    pub(crate) fn to_stored(&self) -> SqlValue {
        match self {
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Float(f) => SqlValue::Real(*f),
            Value::ObjectRef { id, .. } => SqlValue::Integer(*id as i64),
            other => SqlValue::Text(other.canonical()),
        }
    }
    pub(crate) fn from_stored(stored: &SqlValue, type_name: &str) -> Result<Value> {
        let corrupt = || TesseraError::DataCorruption {
            message: format!("{stored:?} cannot be read as {type_name}"),
        };
        let value = match (ValueType::from_name(type_name), stored) {
            (ValueType::Integer, SqlValue::Integer(i)) => Value::Integer(*i),
            (ValueType::Float, SqlValue::Real(f)) => Value::Float(*f),
            (ValueType::Float, SqlValue::Integer(i)) => Value::Float(*i as f64),
            (ValueType::String, SqlValue::Text(s)) => Value::Str(s.clone()),
            (ValueType::Boolean, SqlValue::Text(s)) => match s.as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(corrupt()),
            },
            (ValueType::DateTime, SqlValue::Text(s)) => {
                Value::DateTime(parse_datetime(s).ok_or_else(corrupt)?)
            }
            (ValueType::Object(class), SqlValue::Integer(i)) => Value::ObjectRef {
                id: ObjectId::try_from(*i).map_err(|_| corrupt())?,
                class,
            },
            _ => return Err(corrupt()),
        };
        Ok(value)
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.to_stored()))
    }
}

// Always keeps a fraction or an exponent, so no float shares its text with an integer.
fn canonical_float(f: f64) -> String {
    format!("{f:?}")
}

/// Recognizes the date and time layouts accepted as DATETIME values.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    const DATETIME_LAYOUTS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%d %B %Y %H:%M:%S",
    ];
    const DATE_LAYOUTS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d %B %Y", "%B %d, %Y"];
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.naive_utc());
    }
    DATETIME_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok())
        .or_else(|| {
            DATE_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDate::parse_from_str(text, layout).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

// ------------- Caller input --------------
/// A value as handed in by a caller, before its type has been inferred.
#[derive(Debug, Clone, PartialEq)]
pub enum Raw {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    DateTime(NaiveDateTime),
    Null,
    List(Vec<Raw>),
}

impl From<i64> for Raw {
    fn from(i: i64) -> Self {
        Raw::Int(i)
    }
}
impl From<i32> for Raw {
    fn from(i: i32) -> Self {
        Raw::Int(i64::from(i))
    }
}
impl From<u32> for Raw {
    fn from(i: u32) -> Self {
        Raw::Int(i64::from(i))
    }
}
impl From<u64> for Raw {
    fn from(i: u64) -> Self {
        match i64::try_from(i) {
            Ok(i) => Raw::Int(i),
            Err(_) => Raw::Text(i.to_string()),
        }
    }
}
impl From<f64> for Raw {
    fn from(f: f64) -> Self {
        Raw::Float(f)
    }
}
impl From<bool> for Raw {
    fn from(b: bool) -> Self {
        Raw::Bool(b)
    }
}
impl From<&str> for Raw {
    fn from(s: &str) -> Self {
        Raw::Text(s.to_string())
    }
}
impl From<String> for Raw {
    fn from(s: String) -> Self {
        Raw::Text(s)
    }
}
impl From<NaiveDateTime> for Raw {
    fn from(t: NaiveDateTime) -> Self {
        Raw::DateTime(t)
    }
}
impl From<&Value> for Raw {
    fn from(value: &Value) -> Self {
        match value {
            Value::Integer(i) => Raw::Int(*i),
            Value::Float(f) => Raw::Float(*f),
            Value::Str(s) => Raw::Text(s.clone()),
            Value::Boolean(b) => Raw::Bool(*b),
            Value::DateTime(t) => Raw::DateTime(*t),
            Value::ObjectRef { id, .. } => Raw::from(*id),
        }
    }
}
impl From<Value> for Raw {
    fn from(value: Value) -> Self {
        Raw::from(&value)
    }
}
impl<T: Into<Raw>> From<Option<T>> for Raw {
    fn from(option: Option<T>) -> Self {
        option.map_or(Raw::Null, Into::into)
    }
}
impl<T: Into<Raw>> From<Vec<T>> for Raw {
    fn from(list: Vec<T>) -> Self {
        Raw::List(list.into_iter().map(Into::into).collect())
    }
}

/// Infers the value type of a raw input. `class_of` resolves a candidate object
/// id to the class of an existing object, which takes precedence over INTEGER.
pub fn infer<F>(raw: &Raw, mut class_of: F) -> Result<Value>
where
    F: FnMut(ObjectId) -> Result<Option<String>>,
{
    let mut integer = |i: i64| -> Result<Value> {
        if let Ok(id) = ObjectId::try_from(i) {
            if id > 0 {
                if let Some(class) = class_of(id)? {
                    return Ok(Value::ObjectRef { id, class });
                }
            }
        }
        Ok(Value::Integer(i))
    };
    match raw {
        Raw::Null => Err(TesseraError::InvalidValue("null is not a storable value".into())),
        Raw::List(_) => Err(TesseraError::InvalidValue(
            "lists must be added one value at a time".into(),
        )),
        Raw::Int(i) => integer(*i),
        Raw::Float(f) if f.is_finite() => Ok(Value::Float(*f)),
        Raw::Float(f) => Err(TesseraError::InvalidValue(format!("{f} is not a finite number"))),
        Raw::Bool(b) => Ok(Value::Boolean(*b)),
        Raw::DateTime(t) => Ok(Value::DateTime(*t)),
        Raw::Text(text) => {
            let trimmed = text.trim();
            if INTEGER_TEXT.is_match(trimmed) {
                if let Ok(i) = trimmed.parse::<i64>() {
                    return integer(i);
                }
            }
            if FLOAT_TEXT.is_match(trimmed) {
                if let Ok(f) = trimmed.parse::<f64>() {
                    if f.is_finite() {
                        return Ok(Value::Float(f));
                    }
                }
            }
            if let Some(t) = parse_datetime(trimmed) {
                return Ok(Value::DateTime(t));
            }
            if trimmed.eq_ignore_ascii_case("true") {
                return Ok(Value::Boolean(true));
            }
            if trimmed.eq_ignore_ascii_case("false") {
                return Ok(Value::Boolean(false));
            }
            Ok(Value::Str(text.clone()))
        }
    }
}

/// Inference without an object lookup, so integers never become references.
pub fn infer_literal(raw: &Raw) -> Result<Value> {
    infer(raw, |_| Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_types_from_text() {
        let kinds: Vec<ValueType> = ["42", "-7", "3.25", "1e3", "2012-12-12", "TRUE", "hello", "inf"]
            .iter()
            .map(|text| infer_literal(&Raw::from(*text)).map(|v| v.value_type()))
            .collect::<Result<_>>()
            .expect("inference");
        assert_eq!(
            kinds,
            vec![
                ValueType::Integer,
                ValueType::Integer,
                ValueType::Float,
                ValueType::Float,
                ValueType::DateTime,
                ValueType::Boolean,
                ValueType::String,
                ValueType::String,
            ]
        );
    }

    #[test]
    fn resolved_ids_become_references() {
        let value = infer(&Raw::Int(12), |id| Ok((id == 12).then(|| "PERSON".to_string())))
            .expect("inference");
        assert_eq!(value.value_type(), ValueType::Object("PERSON".into()));
        assert_eq!(value.canonical(), "12");
    }

    #[test]
    fn rejects_unstorable_input() {
        assert!(infer_literal(&Raw::Null).is_err());
        assert!(infer_literal(&Raw::from(vec![1, 2])).is_err());
        assert!(infer_literal(&Raw::Float(f64::NAN)).is_err());
    }

    #[test]
    fn canonical_text_is_stable() {
        assert_eq!(Value::Float(2.0).canonical(), "2.0");
        assert_eq!(Value::Boolean(true).canonical(), "true");
        let t = infer_literal(&Raw::from("2012-12-12T08:30:00")).expect("datetime");
        assert_eq!(t.canonical(), "2012-12-12 08:30:00");
        assert_eq!(t.content_hash(), content_hash("2012-12-12 08:30:00"));
    }

    #[test]
    fn whole_floats_never_hash_like_integers() {
        for whole in [3.0, 1e15, 1e16, -2e20] {
            let float = Value::Float(whole);
            let integer = Value::Integer(whole as i64);
            assert_ne!(float.canonical(), integer.canonical(), "{whole}");
            assert_ne!(float.content_hash(), integer.content_hash());
        }
        assert_eq!(Value::Float(1e15).canonical(), "1000000000000000.0");
    }

    #[test]
    fn stored_values_read_back() {
        let value = Value::DateTime(parse_datetime("2020-02-29").expect("date"));
        let stored = value.to_stored();
        assert_eq!(Value::from_stored(&stored, DATETIME).expect("read"), value);
        assert!(Value::from_stored(&SqlValue::Text("maybe".into()), BOOLEAN).is_err());
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = Clock::default();
        let first = clock.now();
        let second = clock.now();
        assert!(second > first);
        let ahead = Clock::starting_after(i64::MAX / 2);
        assert!(ahead.now() > i64::MAX / 2);
    }
}
