use std::io;

pub type MvResult<T> = Result<T, MvError>;

#[derive(Debug, thiserror::Error)]
pub enum MvError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("unknown value tag: {0:#04x}")]
    UnknownValueTag(u8),

    #[error("sub-block rows are not sorted at index {index}")]
    NotSorted { index: usize },

    #[error("sub-block contains a duplicate key at index {index}")]
    DuplicateKey { index: usize },

    #[error("schema mismatch: expected {expected} values, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("invalid column range [{min}, {max}]")]
    InvalidRange { min: i64, max: i64 },

    #[error("value {value} is not in the dictionary of column {column}")]
    NotInDictionary { column: usize, value: String },

    #[error("column {column} out of range (block has {columns} columns)")]
    ColumnOutOfRange { column: usize, columns: usize },

    #[error("sequence is sealed")]
    Sealed,

    #[error("failed to clone formula state: {0}")]
    FormulaClone(String),

    #[error("formula expects {expected} measure values, got {actual}")]
    FormulaArity { expected: usize, actual: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl MvError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        MvError::Corrupt(msg.into())
    }
}
