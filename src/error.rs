use std::fmt::Display;

/// cinderdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An underlying file error.
    IO(String),
    /// An on-disk structure failed validation: a sorted table whose magic
    /// trailer does not match, or a page/block/entry that cannot be decoded.
    Corrupted(String),
    /// The arena backing a memtable is out of space. The memtable is frozen
    /// and a fresh one must be installed; the Db surface never leaks this.
    SizeFull,
    /// A hinted insert was invoked without a hint.
    NilHint,
    /// Close was attempted while iterators are still outstanding.
    StillReferenced,
    /// Invalid user input, typically an oversized key or value.
    InvalidInput(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Corrupted(msg) => write!(f, "corrupted: {msg}"),
            Error::SizeFull => write!(f, "arena capacity exhausted"),
            Error::NilHint => write!(f, "hinted insert without a hint"),
            Error::StillReferenced => write!(f, "close attempted with live iterators"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

/// A cinderdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
