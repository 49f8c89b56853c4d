use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingPrefix,

    #[error("sentence has no '*' checksum delimiter")]
    MissingChecksum,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    InvalidChecksum { expected: String, actual: String },

    #[error("unknown sentence type: {0}")]
    UnknownSentence(String),

    #[error("{sentence}: expected at least {expected} fields, got {actual}")]
    FieldCount {
        sentence: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid {field} field: {value:?}")]
    InvalidField {
        field: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, NmeaError>;
