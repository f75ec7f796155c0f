use thiserror::Error;

use crate::construct::ObjectId;

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Storage error {code}: {message}")]
    Storage { code: i32, message: String },
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("{0} is not a valid class name")]
    InvalidClass(String),
    #[error("{0} is not a valid property name")]
    InvalidProperty(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("'{value}' does not have the appropriate value type for {property} (expected {expected}, found {found})")]
    TypeMismatch {
        property: String,
        value: String,
        expected: String,
        found: String,
    },
    #[error("Object {0} does not exist")]
    NotFound(ObjectId),
    #[error("Object {object} does not belong to the {class} class")]
    WrongClass { object: ObjectId, class: String },
    #[error("Syntax error in criteria {criteria}: {message}")]
    Syntax { criteria: String, message: String },
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// True when the storage engine reported a table that has never been created.
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Self::Storage { message, .. } if message.starts_with("no such table"))
    }
}

// Helper conversions
impl From<rusqlite::Error> for TesseraError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(failure, message) => Self::Storage {
                code: failure.extended_code,
                message: message.unwrap_or_else(|| failure.to_string()),
            },
            other => Self::Storage {
                code: -1,
                message: other.to_string(),
            },
        }
    }
}
impl From<config::ConfigError> for TesseraError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataCorruption {
            message: e.to_string(),
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for TesseraError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
