use thiserror::Error;

/// Fatal, non-recoverable failure of the metadata scan/parse step.
///
/// A parse error aborts the whole operation, so every
/// variant carries enough context to print a single diagnostic naming the
/// expected and received token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("unterminated quoted value starting at offset {offset}")]
    UnterminatedValue { offset: usize },

    #[error("invalid utf-8 in quoted value at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("attribute `{attr}` value `{value}` is not a valid integer")]
    InvalidInteger { attr: String, value: String },

    #[error("unknown element `{element}`")]
    UnknownElement { element: String },

    #[error("data_block_size `{0}` must be a positive number of sectors")]
    InvalidBlockSize(u64),
}
